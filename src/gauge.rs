use iced::alignment::{Horizontal, Vertical};
use iced::mouse;
use iced::widget::canvas::{self, Frame, Geometry, LineCap, Path, Stroke, Text};
use iced::{Color, Font, Point, Rectangle, Renderer, Theme};

#[derive(Debug, Clone, Copy)]
pub struct GaugeColors {
    pub bg: Color,
    pub label: Color,
    pub text: Color,
    pub track: Color,
}

/// A 270° arc showing a percentage.
#[derive(Debug, Clone)]
pub struct PercentGauge {
    /// 0.0 – 100.0; values outside are pinned.
    pub value: f32,
    pub label: String,
    /// Small line under the label, e.g. "512 / 2048 MB".
    pub caption: Option<String>,
    pub color: Color,
    pub colors: GaugeColors,
}

/// Where an arc sits and how thick it is.
#[derive(Debug, Clone, Copy)]
struct Ring {
    center: Point,
    radius: f32,
    width: f32,
}

const START: f32 = 225.0;
const SWEEP: f32 = 270.0;

impl<Message: 'static> canvas::Program<Message> for PercentGauge {
    type State = ();

    fn draw(
        &self,
        _state: &Self::State,
        renderer: &Renderer,
        _theme: &Theme,
        bounds: Rectangle,
        _cursor: mouse::Cursor,
    ) -> Vec<Geometry> {
        let mut frame = Frame::new(renderer, bounds.size());
        let c = &self.colors;
        frame.fill(&Path::rectangle(Point::ORIGIN, bounds.size()), c.bg);

        let radius = (bounds.width.min(bounds.height) * 0.36).max(18.0);
        let ring = Ring {
            center: Point::new(bounds.width / 2.0, bounds.height * 0.5),
            radius,
            width: (radius * 0.16).max(4.0),
        };

        stroke_arc(&mut frame, ring, SWEEP, c.track);
        let fraction = arc_fraction(self.value);
        if fraction > 0.0 {
            stroke_arc(&mut frame, ring, SWEEP * fraction, self.color);
        }

        centered(&mut frame, format!("{:.0}%", self.value), ring.center, c.text, (radius * 0.42).max(12.0), Font::MONOSPACE);
        let below = Point::new(ring.center.x, ring.center.y + radius * 0.5);
        centered(&mut frame, self.label.clone(), below, c.label, (radius * 0.2).max(9.0), Font::DEFAULT);
        if let Some(caption) = &self.caption {
            let lower = Point::new(ring.center.x, ring.center.y + radius * 0.95);
            centered(&mut frame, caption.clone(), lower, c.label, (radius * 0.17).max(8.0), Font::MONOSPACE);
        }

        vec![frame.into_geometry()]
    }
}

/// Share of the full sweep to paint for a percentage.
fn arc_fraction(value: f32) -> f32 {
    if value.is_finite() {
        (value / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Stroke `sweep` degrees of the ring, clockwise from the lower-left.
fn stroke_arc(frame: &mut Frame, ring: Ring, sweep: f32, color: Color) {
    let steps = ((sweep / 3.0) as usize).max(6);
    let path = Path::new(|b| {
        for i in 0..=steps {
            // Screen y grows downward, so negate the math angle
            let deg = START - sweep * i as f32 / steps as f32;
            let angle = -deg.to_radians();
            let p = Point::new(
                ring.center.x + ring.radius * angle.cos(),
                ring.center.y + ring.radius * angle.sin(),
            );
            if i == 0 {
                b.move_to(p);
            } else {
                b.line_to(p);
            }
        }
    });
    frame.stroke(
        &path,
        Stroke::default().with_color(color).with_width(ring.width).with_line_cap(LineCap::Round),
    );
}

fn centered(frame: &mut Frame, content: String, position: Point, color: Color, size: f32, font: Font) {
    frame.fill_text(Text {
        content,
        position,
        color,
        size: size.into(),
        font,
        horizontal_alignment: Horizontal::Center,
        vertical_alignment: Vertical::Center,
        ..Text::default()
    });
}

/// A small trend line for overview cards.
#[derive(Debug, Clone)]
pub struct Sparkline {
    pub data: Vec<f32>,
    pub color: Color,
}

impl<Message: 'static> canvas::Program<Message> for Sparkline {
    type State = ();

    fn draw(
        &self,
        _state: &Self::State,
        renderer: &Renderer,
        _theme: &Theme,
        bounds: Rectangle,
        _cursor: mouse::Cursor,
    ) -> Vec<Geometry> {
        let mut frame = Frame::new(renderer, bounds.size());
        let points = spark_points(&self.data, bounds.width, bounds.height);
        if points.len() < 2 {
            return vec![frame.into_geometry()];
        }

        let area = Path::new(|b| {
            b.move_to(Point::new(0.0, bounds.height));
            for p in &points {
                b.line_to(*p);
            }
            b.line_to(Point::new(bounds.width, bounds.height));
            b.close();
        });
        frame.fill(&area, Color { a: 0.15, ..self.color });

        let line = Path::new(|b| {
            b.move_to(points[0]);
            for p in &points[1..] {
                b.line_to(*p);
            }
        });
        frame.stroke(&line, Stroke::default().with_color(self.color).with_width(1.2));

        vec![frame.into_geometry()]
    }
}

/// Scale samples into a `w`×`h` box, min at the bottom and max at the top.
fn spark_points(data: &[f32], w: f32, h: f32) -> Vec<Point> {
    let n = data.len();
    if n < 2 {
        return Vec::new();
    }
    let lo = data.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (hi - lo).max(0.01);
    data.iter()
        .enumerate()
        .map(|(i, v)| {
            let x = i as f32 / (n - 1) as f32 * w;
            let y = 1.0 + (h - 2.0) * (1.0 - (v - lo) / range);
            Point::new(x, y)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arc_fraction_pins() {
        assert_eq!(arc_fraction(50.0), 0.5);
        assert_eq!(arc_fraction(-3.0), 0.0);
        assert_eq!(arc_fraction(250.0), 1.0);
        assert_eq!(arc_fraction(f32::NAN), 0.0);
    }

    #[test]
    fn test_spark_points_span_box() {
        let pts = spark_points(&[2.0, 4.0, 3.0], 100.0, 22.0);
        assert_eq!(pts.len(), 3);
        assert_eq!(pts[0].x, 0.0);
        assert_eq!(pts[2].x, 100.0);
        assert_eq!(pts[0].y, 21.0);
        assert_eq!(pts[1].y, 1.0);
        assert!(spark_points(&[1.0], 10.0, 10.0).is_empty());
    }
}
