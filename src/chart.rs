use iced::mouse;
use iced::widget::canvas::{self, Event, Frame, Geometry, Path, Stroke, Text};
use iced::{Color, Font, Point, Rectangle, Renderer, Size, Theme};

use crate::ringbuf::SeriesPoint;

const PAD_LEFT: f32 = 44.0;
const PAD_RIGHT: f32 = 10.0;
const PAD_TOP: f32 = 24.0;
const PAD_BOTTOM: f32 = 20.0;

/// Hovered sample index, snapped to the nearest point.
#[derive(Debug, Clone, Default)]
pub struct ChartState {
    pub hover_idx: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChartColors {
    pub bg: Color,
    pub border: Color,
    pub grid: Color,
    pub label: Color,
    pub text: Color,
}

/// Vertical axis behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum YAxis {
    Fixed { min: f32, max: f32 },
    /// Zero to a rounded-up maximum of the data.
    Auto,
}

/// One line on the chart.
#[derive(Debug, Clone)]
pub struct ChartSeries {
    pub name: String,
    pub color: Color,
    pub values: Vec<f32>,
}

impl ChartSeries {
    pub fn from_points(name: impl Into<String>, color: Color, points: &[SeriesPoint]) -> Self {
        Self {
            name: name.into(),
            color,
            values: points.iter().map(|p| p.value as f32).collect(),
        }
    }
}

/// A time-series line chart. All series share the x axis given by `labels`.
#[derive(Debug, Clone)]
pub struct TimeChart {
    pub title: String,
    pub series: Vec<ChartSeries>,
    /// `HH:MM:SS` per sample, oldest first.
    pub labels: Vec<String>,
    pub y_axis: YAxis,
    pub unit: String,
    pub colors: ChartColors,
    pub show_avg: bool,
}

impl TimeChart {
    fn len(&self) -> usize {
        self.series.iter().map(|s| s.values.len()).max().unwrap_or(0)
    }

    fn y_bounds(&self) -> (f32, f32) {
        match self.y_axis {
            YAxis::Fixed { min, max } => (min, max),
            YAxis::Auto => {
                let peak = self
                    .series
                    .iter()
                    .flat_map(|s| s.values.iter().copied())
                    .fold(0.0_f32, f32::max);
                (0.0, auto_ceiling(peak))
            }
        }
    }
}

/// Plot area inside the widget bounds.
#[derive(Debug, Clone, Copy)]
struct Plot {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    y_min: f32,
    y_max: f32,
}

impl Plot {
    fn new(bounds: Size, y_min: f32, y_max: f32) -> Option<Self> {
        let w = bounds.width - PAD_LEFT - PAD_RIGHT;
        let h = bounds.height - PAD_TOP - PAD_BOTTOM;
        (w > 0.0 && h > 0.0).then_some(Self { x: PAD_LEFT, y: PAD_TOP, w, h, y_min, y_max })
    }

    fn px(&self, idx: usize, n: usize) -> f32 {
        if n < 2 {
            return self.x + self.w;
        }
        self.x + idx as f32 / (n - 1) as f32 * self.w
    }

    fn py(&self, value: f32) -> f32 {
        let range = self.y_max - self.y_min;
        let t = if range > 0.0 { ((value - self.y_min) / range).clamp(0.0, 1.0) } else { 0.5 };
        self.y + self.h * (1.0 - t)
    }

    fn bottom(&self) -> f32 {
        self.y + self.h
    }
}

impl<Message: 'static> canvas::Program<Message> for TimeChart {
    type State = ChartState;

    fn update(
        &self,
        state: &mut Self::State,
        event: Event,
        bounds: Rectangle,
        cursor: mouse::Cursor,
    ) -> (canvas::event::Status, Option<Message>) {
        let n = self.len();
        let plot_w = bounds.width - PAD_LEFT - PAD_RIGHT;
        state.hover_idx = match event {
            Event::Mouse(mouse::Event::CursorMoved { .. }) => cursor
                .position_in(bounds)
                .filter(|p| n >= 2 && plot_w > 0.0 && p.x >= PAD_LEFT && p.x <= PAD_LEFT + plot_w)
                .map(|p| {
                    let idx = ((p.x - PAD_LEFT) / plot_w * (n - 1) as f32).round() as usize;
                    idx.min(n - 1)
                }),
            Event::Mouse(mouse::Event::CursorLeft) => None,
            _ => return (canvas::event::Status::Ignored, None),
        };
        (canvas::event::Status::Ignored, None)
    }

    fn mouse_interaction(&self, _state: &Self::State, bounds: Rectangle, cursor: mouse::Cursor) -> mouse::Interaction {
        if cursor.is_over(bounds) {
            mouse::Interaction::Crosshair
        } else {
            mouse::Interaction::default()
        }
    }

    fn draw(
        &self,
        state: &Self::State,
        renderer: &Renderer,
        _theme: &Theme,
        bounds: Rectangle,
        _cursor: mouse::Cursor,
    ) -> Vec<Geometry> {
        let mut frame = Frame::new(renderer, bounds.size());
        let c = &self.colors;
        let (y_min, y_max) = self.y_bounds();
        let Some(plot) = Plot::new(bounds.size(), y_min, y_max) else {
            return vec![frame.into_geometry()];
        };

        frame.fill(&Path::rectangle(Point::ORIGIN, bounds.size()), c.bg);
        frame.stroke(
            &Path::rectangle(Point::new(0.5, 0.5), Size::new(bounds.width - 1.0, bounds.height - 1.0)),
            Stroke::default().with_color(c.border).with_width(0.5),
        );
        put_text(&mut frame, &self.title, Point::new(PAD_LEFT, 4.0), c.text, 12.0, Font::DEFAULT);

        draw_grid(&mut frame, &plot, c);

        let n = self.len();
        if n == 0 {
            put_text(
                &mut frame,
                "waiting for data",
                Point::new(plot.x + plot.w / 2.0 - 45.0, plot.y + plot.h / 2.0 - 6.0),
                c.label,
                11.0,
                Font::DEFAULT,
            );
            return vec![frame.into_geometry()];
        }

        draw_time_axis(&mut frame, &plot, &self.labels, c.label);

        for s in &self.series {
            draw_line(&mut frame, &plot, s, n);
        }

        if self.show_avg {
            for s in &self.series {
                if let Some(avg) = mean(&s.values) {
                    draw_avg(&mut frame, &plot, s.color, avg);
                }
            }
        }

        if let Some(idx) = state.hover_idx.filter(|i| *i < n) {
            self.draw_hover(&mut frame, &plot, idx, n);
        }

        vec![frame.into_geometry()]
    }
}

impl TimeChart {
    fn draw_hover(&self, frame: &mut Frame, plot: &Plot, idx: usize, n: usize) {
        let c = &self.colors;
        let x = plot.px(idx, n);
        frame.stroke(
            &Path::line(Point::new(x, plot.y), Point::new(x, plot.bottom())),
            Stroke::default().with_color(Color { a: 0.35, ..c.text }).with_width(1.0),
        );

        let mut lines = Vec::new();
        if let Some(label) = self.labels.get(idx) {
            lines.push((label.clone(), c.label));
        }
        for s in &self.series {
            let offset = n - s.values.len();
            let Some(&v) = idx.checked_sub(offset).and_then(|i| s.values.get(i)) else { continue };
            let dot = Point::new(x, plot.py(v));
            frame.fill(&Path::circle(dot, 6.0), Color { a: 0.25, ..s.color });
            frame.fill(&Path::circle(dot, 3.5), s.color);
            lines.push((format!("{}: {:.1}{}", s.name, v, self.unit), s.color));
        }

        let width = lines.iter().map(|(t, _)| t.len()).max().unwrap_or(0) as f32 * 6.6 + 14.0;
        let height = lines.len() as f32 * 15.0 + 6.0;
        let tx = if x + 12.0 + width > plot.x + plot.w { x - 12.0 - width } else { x + 12.0 };
        let ty = plot.y + 4.0;
        let boxed = Path::rectangle(Point::new(tx, ty), Size::new(width, height));
        frame.fill(&boxed, Color { a: 0.95, ..c.bg });
        frame.stroke(&boxed, Stroke::default().with_color(c.border).with_width(0.8));
        for (i, (text, color)) in lines.into_iter().enumerate() {
            put_text(frame, &text, Point::new(tx + 7.0, ty + 4.0 + i as f32 * 15.0), color, 11.0, Font::MONOSPACE);
        }
    }
}

fn draw_grid(frame: &mut Frame, plot: &Plot, c: &ChartColors) {
    let range = plot.y_max - plot.y_min;
    if range <= 0.0 {
        return;
    }
    let step = nice_tick_step(range, 5);
    let mut tick = (plot.y_min / step).ceil() * step;
    while tick <= plot.y_max + step * 0.001 {
        let y = plot.py(tick);
        frame.stroke(
            &Path::line(Point::new(plot.x, y), Point::new(plot.x + plot.w, y)),
            Stroke::default().with_color(c.grid).with_width(1.0),
        );
        let text = if step >= 1.0 { format!("{tick:.0}") } else { format!("{tick:.1}") };
        put_text(frame, &text, Point::new(4.0, y - 6.0), c.label, 10.0, Font::MONOSPACE);
        tick += step;
    }
}

/// First, middle and last timestamps under the plot.
fn draw_time_axis(frame: &mut Frame, plot: &Plot, labels: &[String], color: Color) {
    let n = labels.len();
    let picks = match n {
        0 => vec![],
        1 => vec![0],
        2 => vec![0, 1],
        _ => vec![0, n / 2, n - 1],
    };
    for idx in picks {
        let x = (plot.px(idx, n) - 24.0).clamp(plot.x, plot.x + plot.w - 48.0);
        put_text(frame, &labels[idx], Point::new(x, plot.bottom() + 4.0), color, 10.0, Font::MONOSPACE);
    }
}

fn draw_line(frame: &mut Frame, plot: &Plot, s: &ChartSeries, n: usize) {
    if s.values.is_empty() {
        return;
    }
    // Shorter series are right-aligned so the newest samples line up
    let offset = n - s.values.len();
    if s.values.len() == 1 {
        let p = Point::new(plot.px(n - 1, n), plot.py(s.values[0]));
        frame.fill(&Path::circle(p, 2.5), s.color);
        return;
    }

    let line = Path::new(|b| {
        for (i, &v) in s.values.iter().enumerate() {
            let p = Point::new(plot.px(offset + i, n), plot.py(v));
            if i == 0 {
                b.move_to(p);
            } else {
                b.line_to(p);
            }
        }
    });
    let area = Path::new(|b| {
        b.move_to(Point::new(plot.px(offset, n), plot.bottom()));
        for (i, &v) in s.values.iter().enumerate() {
            b.line_to(Point::new(plot.px(offset + i, n), plot.py(v)));
        }
        b.line_to(Point::new(plot.px(n - 1, n), plot.bottom()));
        b.close();
    });
    frame.fill(&area, Color { a: 0.12, ..s.color });
    frame.stroke(&line, Stroke::default().with_color(s.color).with_width(1.8));
}

fn draw_avg(frame: &mut Frame, plot: &Plot, color: Color, avg: f32) {
    let y = plot.py(avg);
    let faint = Color { a: 0.5, ..color };
    let mut x = plot.x;
    while x < plot.x + plot.w {
        let end = (x + 6.0).min(plot.x + plot.w);
        frame.stroke(&Path::line(Point::new(x, y), Point::new(end, y)), Stroke::default().with_color(faint).with_width(1.0));
        x += 10.0;
    }
    put_text(frame, &format!("avg {avg:.1}"), Point::new(plot.x + plot.w - 56.0, y - 13.0), faint, 9.0, Font::MONOSPACE);
}

fn put_text(frame: &mut Frame, content: &str, position: Point, color: Color, size: f32, font: Font) {
    frame.fill_text(Text {
        content: content.to_string(),
        position,
        color,
        size: size.into(),
        font,
        ..Text::default()
    });
}

fn mean(values: &[f32]) -> Option<f32> {
    (!values.is_empty()).then(|| values.iter().sum::<f32>() / values.len() as f32)
}

/// Round a data maximum up to a readable axis ceiling (never below 1).
fn auto_ceiling(peak: f32) -> f32 {
    if !peak.is_finite() || peak <= 1.0 {
        return 1.0;
    }
    let step = nice_tick_step(peak, 5);
    (peak / step).ceil() * step
}

/// Pick a "nice" tick step (1, 2, 5, 10, 20, 50, …) so that the range
/// is divided into at most `max_ticks` intervals.
fn nice_tick_step(range: f32, max_ticks: usize) -> f32 {
    let rough = range / max_ticks as f32;
    let mag = 10f32.powf(rough.log10().floor());
    let norm = rough / mag;
    let nice = if norm <= 1.0 {
        1.0
    } else if norm <= 2.0 {
        2.0
    } else if norm <= 5.0 {
        5.0
    } else {
        10.0
    };
    (nice * mag).max(f32::EPSILON)
}
