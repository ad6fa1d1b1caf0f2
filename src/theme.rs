use iced::Color;
use serde::{Deserialize, Serialize};

// ─── ACCENTS ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccentColor {
    Teal,
    Blue,
    Violet,
    Amber,
}

impl AccentColor {
    pub const ALL: &[AccentColor] = &[AccentColor::Teal, AccentColor::Blue, AccentColor::Violet, AccentColor::Amber];

    pub fn color(&self) -> Color {
        match self {
            AccentColor::Teal => hex(0x2d, 0xd4, 0xbf),
            AccentColor::Blue => hex(0x60, 0xa5, 0xfa),
            AccentColor::Violet => hex(0xa7, 0x8b, 0xfa),
            AccentColor::Amber => hex(0xfb, 0xbf, 0x24),
        }
    }
}

impl std::fmt::Display for AccentColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AccentColor::Teal => "Teal",
            AccentColor::Blue => "Blue",
            AccentColor::Violet => "Violet",
            AccentColor::Amber => "Amber",
        })
    }
}

// ─── THEMES ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThemeVariant {
    Midnight,
    Slate,
    Daylight,
}

impl ThemeVariant {
    pub const ALL: &[ThemeVariant] = &[ThemeVariant::Midnight, ThemeVariant::Slate, ThemeVariant::Daylight];

    pub fn is_light(&self) -> bool {
        matches!(self, ThemeVariant::Daylight)
    }

    /// The built-in iced theme this variant sits on.
    pub fn iced_theme(&self) -> iced::Theme {
        if self.is_light() {
            iced::Theme::Light
        } else {
            iced::Theme::Dark
        }
    }
}

impl std::fmt::Display for ThemeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ThemeVariant::Midnight => "Midnight",
            ThemeVariant::Slate => "Slate",
            ThemeVariant::Daylight => "Daylight",
        })
    }
}

// ─── PALETTE ────────────────────────────────────────────────────

/// Semantic colors for one theme + accent combination.
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    pub bg: Color,
    pub panel_bg: Color,
    pub border: Color,
    pub grid: Color,
    pub label: Color,
    pub text: Color,
    pub bar_bg: Color,
    pub accent: Color,
    pub ok: Color,
    pub warn: Color,
    pub alert: Color,
    pub secondary: Color,
}

pub fn build_palette(theme: ThemeVariant, accent: AccentColor) -> Palette {
    Palette {
        accent: accent.color(),
        ..base_palette(theme)
    }
}

fn base_palette(theme: ThemeVariant) -> Palette {
    match theme {
        ThemeVariant::Midnight => Palette {
            bg:        hex(0x0f, 0x14, 0x1c),
            panel_bg:  hex(0x16, 0x1d, 0x28),
            border:    hex(0x26, 0x30, 0x3f),
            grid:      Color::from_rgba(1.0, 1.0, 1.0, 0.05),
            label:     hex(0x8b, 0x98, 0xab),
            text:      hex(0xe2, 0xe8, 0xf0),
            bar_bg:    hex(0x26, 0x30, 0x3f),
            accent:    hex(0x2d, 0xd4, 0xbf),
            ok:        hex(0x4a, 0xde, 0x80),
            warn:      hex(0xfa, 0xcc, 0x15),
            alert:     hex(0xf8, 0x71, 0x71),
            secondary: hex(0xc0, 0x84, 0xfc),
        },
        ThemeVariant::Slate => Palette {
            bg:        hex(0x1e, 0x23, 0x2b),
            panel_bg:  hex(0x27, 0x2e, 0x38),
            border:    hex(0x3a, 0x44, 0x52),
            grid:      Color::from_rgba(1.0, 1.0, 1.0, 0.06),
            label:     hex(0x9a, 0xa5, 0xb4),
            text:      hex(0xee, 0xf1, 0xf5),
            bar_bg:    hex(0x3a, 0x44, 0x52),
            accent:    hex(0x60, 0xa5, 0xfa),
            ok:        hex(0x86, 0xef, 0xac),
            warn:      hex(0xfd, 0xe0, 0x47),
            alert:     hex(0xfc, 0xa5, 0xa5),
            secondary: hex(0xd8, 0xb4, 0xfe),
        },
        ThemeVariant::Daylight => Palette {
            bg:        hex(0xf6, 0xf7, 0xf9),
            panel_bg:  hex(0xff, 0xff, 0xff),
            border:    hex(0xd9, 0xde, 0xe5),
            grid:      Color::from_rgba(0.0, 0.0, 0.0, 0.06),
            label:     hex(0x5b, 0x66, 0x75),
            text:      hex(0x1f, 0x29, 0x37),
            bar_bg:    hex(0xe5, 0xe9, 0xef),
            accent:    hex(0x0d, 0x94, 0x88),
            ok:        hex(0x16, 0xa3, 0x4a),
            warn:      hex(0xca, 0x8a, 0x04),
            alert:     hex(0xdc, 0x26, 0x26),
            secondary: hex(0x93, 0x33, 0xea),
        },
    }
}

const fn hex(r: u8, g: u8, b: u8) -> Color {
    Color::from_rgb(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
}
