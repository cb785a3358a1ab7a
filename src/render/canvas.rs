use std::fmt::{self, Write as FmtWrite};
use std::path::Path;

use crate::Result;

/// RGBA colour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f64,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const GREY: Color = Color::rgb(217, 217, 217);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    /// Parse `#rrggbb`; malformed components read as zero
    pub fn hex(s: &str) -> Self {
        let s = s.strip_prefix('#').unwrap_or(s);
        let part = |range: std::ops::Range<usize>| {
            s.get(range).and_then(|p| u8::from_str_radix(p, 16).ok()).unwrap_or(0)
        };
        Self { r: part(0..2), g: part(2..4), b: part(4..6), a: 1.0 }
    }

    pub const fn with_alpha(mut self, a: f64) -> Self {
        self.a = a;
        self
    }

    pub fn to_svg_fill(&self) -> String {
        if (self.a - 1.0).abs() < 1e-6 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("rgba({},{},{},{:.3})", self.r, self.g, self.b, self.a)
        }
    }

    /// Linear interpolation between two colours
    pub fn lerp(a: Color, b: Color, t: f64) -> Color {
        let t = t.clamp(0.0, 1.0);
        let mix = |x: u8, y: u8| (x as f64 * (1.0 - t) + y as f64 * t).round() as u8;
        Color {
            r: mix(a.r, b.r),
            g: mix(a.g, b.g),
            b: mix(a.b, b.b),
            a: a.a * (1.0 - t) + b.a * t,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_svg_fill())
    }
}

/// Fill + stroke style for rectangles and polygons
#[derive(Debug, Clone)]
pub struct Style {
    pub fill: Option<Color>,
    pub stroke: Option<Color>,
    pub stroke_width: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self { fill: None, stroke: None, stroke_width: 1.0 }
    }
}

impl Style {
    pub fn filled(color: Color) -> Self {
        Self { fill: Some(color), ..Default::default() }
    }

    pub fn stroked(color: Color, width: f64) -> Self {
        Self { stroke: Some(color), stroke_width: width, ..Default::default() }
    }
}

/// Line style
#[derive(Debug, Clone)]
pub struct LineStyle {
    pub color: Color,
    pub width: f64,
    pub dash: Option<String>,
}

impl LineStyle {
    pub fn solid(color: Color, width: f64) -> Self {
        Self { color, width, dash: None }
    }

    pub fn dashed(color: Color, width: f64) -> Self {
        Self { color, width, dash: Some("6 3".into()) }
    }

    pub fn dotted(color: Color, width: f64) -> Self {
        Self { color, width, dash: Some("2 2".into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAnchor {
    Start,
    Middle,
    End,
}

impl TextAnchor {
    fn as_str(&self) -> &'static str {
        match self {
            TextAnchor::Start => "start",
            TextAnchor::Middle => "middle",
            TextAnchor::End => "end",
        }
    }
}

/// Text style
#[derive(Debug, Clone)]
pub struct TextStyle {
    pub size: f64,
    pub color: Color,
    pub anchor: TextAnchor,
    pub bold: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self { size: 11.0, color: Color::BLACK, anchor: TextAnchor::Start, bold: false }
    }
}

impl TextStyle {
    pub fn sized(size: f64, anchor: TextAnchor) -> Self {
        Self { size, anchor, ..Default::default() }
    }
}

/// An SVG element stored for deferred rendering
#[derive(Debug, Clone)]
enum SvgElement {
    Rect { x: f64, y: f64, w: f64, h: f64, style: Style },
    Line { x1: f64, y1: f64, x2: f64, y2: f64, style: LineStyle, class: Option<String> },
    Polyline { points: Vec<(f64, f64)>, style: LineStyle, class: Option<String> },
    /// Multi-ring path filled with the even-odd rule (holes, multipolygons)
    Rings { rings: Vec<Vec<(f64, f64)>>, style: Style, class: Option<String> },
    Text { x: f64, y: f64, content: String, style: TextStyle, rotate: Option<f64> },
}

/// Immediate-mode SVG canvas; coordinates in pixels from the top left
pub struct Canvas {
    pub width: f64,
    pub height: f64,
    elements: Vec<(SvgElement, Option<String>)>,
    defs: Vec<String>,
    clip: Option<String>,
    next_clip_id: usize,
}

impl Canvas {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            elements: Vec::new(),
            defs: Vec::new(),
            clip: None,
            next_clip_id: 0,
        }
    }

    // --- Drawing primitives ---

    pub fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, style: &Style) {
        self.push(SvgElement::Rect { x, y, w, h, style: style.clone() });
    }

    pub fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, style: &LineStyle) {
        self.push(SvgElement::Line { x1, y1, x2, y2, style: style.clone(), class: None });
    }

    /// Line tagged with a CSS class, for markers a reader may want to restyle
    pub fn line_with_class(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, style: &LineStyle, class: &str) {
        self.push(SvgElement::Line { x1, y1, x2, y2, style: style.clone(), class: Some(class.to_string()) });
    }

    pub fn polyline(&mut self, points: &[(f64, f64)], style: &LineStyle, class: Option<&str>) {
        if points.is_empty() {
            return;
        }
        self.push(SvgElement::Polyline {
            points: points.to_vec(),
            style: style.clone(),
            class: class.map(str::to_string),
        });
    }

    pub fn rings(&mut self, rings: Vec<Vec<(f64, f64)>>, style: &Style, class: Option<&str>) {
        if rings.iter().all(|r| r.len() < 3) {
            return;
        }
        self.push(SvgElement::Rings { rings, style: style.clone(), class: class.map(str::to_string) });
    }

    pub fn text(&mut self, x: f64, y: f64, content: &str, style: &TextStyle) {
        self.push(SvgElement::Text { x, y, content: content.to_string(), style: style.clone(), rotate: None });
    }

    pub fn text_rotated(&mut self, x: f64, y: f64, content: &str, style: &TextStyle, angle: f64) {
        self.push(SvgElement::Text {
            x,
            y,
            content: content.to_string(),
            style: style.clone(),
            rotate: Some(angle),
        });
    }

    // --- Clip paths ---

    /// Clip subsequent elements to a rectangle until `pop_clip`
    pub fn push_clip(&mut self, x: f64, y: f64, w: f64, h: f64) -> String {
        let id = format!("clip{}", self.next_clip_id);
        self.next_clip_id += 1;
        self.defs.push(format!(
            r#"<clipPath id="{id}"><rect x="{x:.2}" y="{y:.2}" width="{w:.2}" height="{h:.2}" /></clipPath>"#
        ));
        self.clip = Some(id.clone());
        id
    }

    pub fn pop_clip(&mut self) {
        self.clip = None;
    }

    fn push(&mut self, elem: SvgElement) {
        self.elements.push((elem, self.clip.clone()));
    }

    // --- SVG output ---

    pub fn finish_svg(&self) -> String {
        let mut out = String::with_capacity(16 * 1024);
        let _ = writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = self.width,
            h = self.height,
        );

        if !self.defs.is_empty() {
            out.push_str("<defs>\n");
            for d in &self.defs {
                out.push_str(d);
                out.push('\n');
            }
            out.push_str("</defs>\n");
        }

        let _ = writeln!(out, r#"<rect width="{}" height="{}" fill="white" />"#, self.width, self.height);

        for (elem, clip) in &self.elements {
            render_element(&mut out, elem, clip.as_deref());
        }

        out.push_str("</svg>\n");
        out
    }
}

fn render_element(out: &mut String, elem: &SvgElement, clip: Option<&str>) {
    match elem {
        SvgElement::Rect { x, y, w, h, style } => {
            let _ = write!(out, r#"<rect x="{x:.2}" y="{y:.2}" width="{w:.2}" height="{h:.2}""#);
            write_style_attrs(out, style);
        }
        SvgElement::Line { x1, y1, x2, y2, style, class } => {
            let _ = write!(out, r#"<line x1="{x1:.2}" y1="{y1:.2}" x2="{x2:.2}" y2="{y2:.2}""#);
            write_class(out, class.as_deref());
            write_line_attrs(out, style);
        }
        SvgElement::Polyline { points, style, class } => {
            out.push_str(r#"<polyline points=""#);
            write_points(out, points);
            out.push_str(r#"" fill="none""#);
            write_class(out, class.as_deref());
            write_line_attrs(out, style);
        }
        SvgElement::Rings { rings, style, class } => {
            out.push_str(r#"<path d=""#);
            for ring in rings.iter().filter(|r| r.len() >= 3) {
                for (i, (x, y)) in ring.iter().enumerate() {
                    let cmd = if i == 0 { 'M' } else { 'L' };
                    let _ = write!(out, "{cmd}{x:.2},{y:.2} ");
                }
                out.push_str("Z ");
            }
            out.push_str(r#"" fill-rule="evenodd""#);
            write_class(out, class.as_deref());
            write_style_attrs(out, style);
        }
        SvgElement::Text { x, y, content, style, rotate } => {
            let _ = write!(
                out,
                r#"<text x="{x:.2}" y="{y:.2}" font-family="Helvetica, Arial, sans-serif" font-size="{:.1}" fill="{}" text-anchor="{}""#,
                style.size,
                style.color.to_svg_fill(),
                style.anchor.as_str()
            );
            if style.bold {
                out.push_str(r#" font-weight="bold""#);
            }
            if let Some(angle) = rotate {
                let _ = write!(out, r#" transform="rotate({angle:.1},{x:.2},{y:.2})""#);
            }
            write_clip(out, clip);
            out.push('>');
            out.push_str(&escape_xml(content));
            out.push_str("</text>\n");
            return;
        }
    }
    write_clip(out, clip);
    out.push_str(" />\n");
}

fn write_points(out: &mut String, points: &[(f64, f64)]) {
    for (i, (x, y)) in points.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{x:.2},{y:.2}");
    }
}

fn write_class(out: &mut String, class: Option<&str>) {
    if let Some(c) = class {
        let _ = write!(out, r#" class="{}""#, escape_xml(c));
    }
}

fn write_clip(out: &mut String, clip: Option<&str>) {
    if let Some(id) = clip {
        let _ = write!(out, r#" clip-path="url(#{id})""#);
    }
}

fn write_style_attrs(out: &mut String, style: &Style) {
    match style.fill {
        Some(c) => {
            let _ = write!(out, r#" fill="{}""#, c.to_svg_fill());
        }
        None => out.push_str(r#" fill="none""#),
    }
    if let Some(c) = style.stroke {
        let _ = write!(out, r#" stroke="{}" stroke-width="{:.2}""#, c.to_svg_fill(), style.stroke_width);
    }
}

fn write_line_attrs(out: &mut String, style: &LineStyle) {
    let _ = write!(out, r#" stroke="{}" stroke-width="{:.2}""#, style.color.to_svg_fill(), style.width);
    if let Some(dash) = &style.dash {
        let _ = write!(out, r#" stroke-dasharray="{dash}""#);
    }
}

pub fn escape_xml(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Write SVG string to a file, creating parent directories
pub fn save_svg(svg: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, svg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_hex_and_lerp() {
        assert_eq!(Color::hex("#08306b"), Color::rgb(8, 48, 107));
        assert_eq!(Color::hex("zz").r, 0);
        let mid = Color::lerp(Color::BLACK, Color::WHITE, 0.5);
        assert_eq!(mid.r, 128);
        assert_eq!(Color::rgb(1, 2, 3).with_alpha(0.5).to_svg_fill(), "rgba(1,2,3,0.500)");
    }

    #[test]
    fn test_clip_applies_until_popped() {
        let mut canvas = Canvas::new(100.0, 50.0);
        canvas.push_clip(0.0, 0.0, 10.0, 10.0);
        canvas.line(0.0, 0.0, 5.0, 5.0, &LineStyle::solid(Color::BLACK, 1.0));
        canvas.pop_clip();
        canvas.line(0.0, 0.0, 5.0, 5.0, &LineStyle::solid(Color::BLACK, 1.0));
        let svg = canvas.finish_svg();
        assert_eq!(svg.matches("clip-path=\"url(#clip0)\"").count(), 1);
        assert!(svg.contains("<clipPath id=\"clip0\">"));
    }

    #[test]
    fn test_text_is_escaped() {
        let mut canvas = Canvas::new(10.0, 10.0);
        canvas.text(0.0, 0.0, "Cost (£) <total> & more", &TextStyle::default());
        let svg = canvas.finish_svg();
        assert!(svg.contains("Cost (£) &lt;total&gt; &amp; more"));
    }
}
