//! Frame annotation for the MJPEG stream
//!
//! Draws face boxes, the capture timestamp and the "camera not available"
//! placeholder straight into RGB buffers with a tiny bitmap font.

use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};

use crate::faces::FaceBox;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

/// Draw a green rectangle around every face.
pub fn draw_faces(img: &mut RgbImage, faces: &[FaceBox]) {
    let thickness = if img.width() >= 640 { 2 } else { 1 };
    for face in faces {
        draw_rect(img, face, GREEN, thickness);
    }
}

fn draw_rect(img: &mut RgbImage, face: &FaceBox, color: Rgb<u8>, thickness: u32) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let x1 = face.x.max(0) as u32;
    let y1 = face.y.max(0) as u32;
    let x2 = (face.x.saturating_add(face.width as i32).max(0) as u32).min(img.width() - 1);
    let y2 = (face.y.saturating_add(face.height as i32).max(0) as u32).min(img.height() - 1);

    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for t in 0..thickness {
        for x in x1..=x2 {
            if y1 + t <= y2 {
                img.put_pixel(x, y1 + t, color);
            }
            if y2 >= y1 + t {
                img.put_pixel(x, y2 - t, color);
            }
        }
        for y in y1..=y2 {
            if x1 + t <= x2 {
                img.put_pixel(x1 + t, y, color);
            }
            if x2 >= x1 + t {
                img.put_pixel(x2 - t, y, color);
            }
        }
    }
}

/// Stamp `%Y-%m-%d %H:%M:%S` in the top-left corner.
pub fn stamp_timestamp(img: &mut RgbImage, now: DateTime<Local>) {
    let text = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let scale = if img.width() >= 640 { 2 } else { 1 };
    draw_text(img, &text, 10, 10, GREEN, scale);
}

/// Black frame shown while no camera frame exists.
pub fn placeholder_frame() -> RgbImage {
    let mut img = RgbImage::new(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
    let text = "camera not available";
    let scale = 3;
    let text_width = text.chars().count() as u32 * 6 * scale;
    let x = PLACEHOLDER_WIDTH.saturating_sub(text_width) / 2;
    draw_text(&mut img, text, x, PLACEHOLDER_HEIGHT / 2 - 10, WHITE, scale);
    img
}

/// 5x7 glyph for `ch`, lowercased. Unknown characters render blank.
fn glyph(ch: char) -> [[u8; 5]; 7] {
    match ch {
        '0' => [[0,1,1,1,0],[1,0,0,0,1],[1,0,0,1,1],[1,0,1,0,1],[1,1,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        '1' => [[0,0,1,0,0],[0,1,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,1,1,1,0]],
        '2' => [[0,1,1,1,0],[1,0,0,0,1],[0,0,0,0,1],[0,0,0,1,0],[0,0,1,0,0],[0,1,0,0,0],[1,1,1,1,1]],
        '3' => [[0,1,1,1,0],[1,0,0,0,1],[0,0,0,0,1],[0,0,1,1,0],[0,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        '4' => [[0,0,0,1,0],[0,0,1,1,0],[0,1,0,1,0],[1,0,0,1,0],[1,1,1,1,1],[0,0,0,1,0],[0,0,0,1,0]],
        '5' => [[1,1,1,1,1],[1,0,0,0,0],[1,1,1,1,0],[0,0,0,0,1],[0,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        '6' => [[0,1,1,1,0],[1,0,0,0,0],[1,0,0,0,0],[1,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        '7' => [[1,1,1,1,1],[0,0,0,0,1],[0,0,0,1,0],[0,0,1,0,0],[0,1,0,0,0],[0,1,0,0,0],[0,1,0,0,0]],
        '8' => [[0,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        '9' => [[0,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,1],[0,0,0,0,1],[0,0,0,0,1],[0,1,1,1,0]],
        'a' => [[0,0,0,0,0],[0,0,0,0,0],[0,1,1,1,0],[0,0,0,0,1],[0,1,1,1,1],[1,0,0,0,1],[0,1,1,1,1]],
        'b' => [[1,0,0,0,0],[1,0,0,0,0],[1,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[1,1,1,1,0]],
        'c' => [[0,0,0,0,0],[0,0,0,0,0],[0,1,1,1,0],[1,0,0,0,0],[1,0,0,0,0],[1,0,0,0,0],[0,1,1,1,0]],
        'd' => [[0,0,0,0,1],[0,0,0,0,1],[0,1,1,1,1],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,1]],
        'e' => [[0,0,0,0,0],[0,0,0,0,0],[0,1,1,1,0],[1,0,0,0,1],[1,1,1,1,1],[1,0,0,0,0],[0,1,1,1,0]],
        'f' => [[0,0,1,1,0],[0,1,0,0,0],[0,1,0,0,0],[1,1,1,0,0],[0,1,0,0,0],[0,1,0,0,0],[0,1,0,0,0]],
        'g' => [[0,0,0,0,0],[0,1,1,1,1],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,1],[0,0,0,0,1],[0,1,1,1,0]],
        'h' => [[1,0,0,0,0],[1,0,0,0,0],[1,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1]],
        'i' => [[0,0,1,0,0],[0,0,0,0,0],[0,1,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,1,1,1,0]],
        'k' => [[1,0,0,0,0],[1,0,0,0,0],[1,0,0,1,0],[1,0,1,0,0],[1,1,0,0,0],[1,0,1,0,0],[1,0,0,1,0]],
        'l' => [[0,1,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,1,1,1,0]],
        'm' => [[0,0,0,0,0],[0,0,0,0,0],[1,1,0,1,0],[1,0,1,0,1],[1,0,1,0,1],[1,0,1,0,1],[1,0,1,0,1]],
        'n' => [[0,0,0,0,0],[0,0,0,0,0],[1,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1]],
        'o' => [[0,0,0,0,0],[0,0,0,0,0],[0,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,0]],
        'p' => [[0,0,0,0,0],[1,1,1,1,0],[1,0,0,0,1],[1,0,0,0,1],[1,1,1,1,0],[1,0,0,0,0],[1,0,0,0,0]],
        'r' => [[0,0,0,0,0],[0,0,0,0,0],[1,0,1,1,0],[1,1,0,0,1],[1,0,0,0,0],[1,0,0,0,0],[1,0,0,0,0]],
        's' => [[0,0,0,0,0],[0,0,0,0,0],[0,1,1,1,1],[1,0,0,0,0],[0,1,1,1,0],[0,0,0,0,1],[1,1,1,1,0]],
        't' => [[0,0,1,0,0],[0,0,1,0,0],[0,1,1,1,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,1,0,0],[0,0,0,1,0]],
        'u' => [[0,0,0,0,0],[0,0,0,0,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[0,1,1,1,1]],
        'v' => [[0,0,0,0,0],[0,0,0,0,0],[1,0,0,0,1],[1,0,0,0,1],[1,0,0,0,1],[0,1,0,1,0],[0,0,1,0,0]],
        'w' => [[0,0,0,0,0],[0,0,0,0,0],[1,0,0,0,1],[1,0,1,0,1],[1,0,1,0,1],[1,0,1,0,1],[0,1,0,1,0]],
        'y' => [[0,0,0,0,0],[1,0,0,0,1],[1,0,0,0,1],[0,1,0,1,0],[0,0,1,0,0],[0,1,0,0,0],[1,0,0,0,0]],
        ':' => [[0,0,0,0,0],[0,1,1,0,0],[0,1,1,0,0],[0,0,0,0,0],[0,1,1,0,0],[0,1,1,0,0],[0,0,0,0,0]],
        '.' => [[0,0,0,0,0],[0,0,0,0,0],[0,0,0,0,0],[0,0,0,0,0],[0,0,0,0,0],[0,1,1,0,0],[0,1,1,0,0]],
        '-' => [[0,0,0,0,0],[0,0,0,0,0],[0,0,0,0,0],[1,1,1,1,1],[0,0,0,0,0],[0,0,0,0,0],[0,0,0,0,0]],
        '%' => [[1,1,0,0,1],[1,1,0,0,1],[0,0,0,1,0],[0,0,1,0,0],[0,1,0,0,0],[1,0,0,1,1],[1,0,0,1,1]],
        _ => [[0; 5]; 7],
    }
}

/// Draw blocky text; each glyph advances 6 * `scale` pixels.
pub fn draw_text(img: &mut RgbImage, text: &str, x: u32, y: u32, color: Rgb<u8>, scale: u32) {
    let mut cursor_x = x;
    for ch in text.chars().flat_map(char::to_lowercase) {
        for (row_idx, row) in glyph(ch).iter().enumerate() {
            for (col_idx, &pixel) in row.iter().enumerate() {
                if pixel == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = cursor_x + (col_idx as u32) * scale + sx;
                        let py = y + (row_idx as u32) * scale + sy;
                        if px < img.width() && py < img.height() {
                            img.put_pixel(px, py, color);
                        }
                    }
                }
            }
        }
        cursor_x += 6 * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn face(x: i32, y: i32, w: u32, h: u32) -> FaceBox {
        FaceBox { x, y, width: w, height: h, score: 5.0 }
    }

    #[test]
    fn draw_faces_outlines_box() {
        let mut img = RgbImage::new(100, 100);
        draw_faces(&mut img, &[face(10, 20, 30, 40)]);

        assert_eq!(*img.get_pixel(10, 20), GREEN);
        assert_eq!(*img.get_pixel(40, 60), GREEN);
        assert_eq!(*img.get_pixel(25, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn draw_faces_clamps_out_of_bounds_box() {
        let mut img = RgbImage::new(50, 50);
        draw_faces(&mut img, &[face(-10, -10, 200, 200)]);

        assert_eq!(*img.get_pixel(0, 0), GREEN);
        assert_eq!(*img.get_pixel(49, 49), GREEN);
    }

    #[test]
    fn timestamp_paints_pixels_top_left() {
        let mut img = RgbImage::new(320, 240);
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        stamp_timestamp(&mut img, now);

        let painted = (0..40)
            .flat_map(|y| (0..200).map(move |x| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) == GREEN)
            .count();
        assert!(painted > 50);
        assert_eq!(*img.get_pixel(300, 200), Rgb([0, 0, 0]));
    }

    #[test]
    fn placeholder_has_expected_size_and_text() {
        let img = placeholder_frame();
        assert_eq!(img.dimensions(), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
        assert!(img.pixels().any(|p| *p == WHITE));
    }
}
