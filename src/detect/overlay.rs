//! Detection overlay: boxes, per-box score labels and the running count.

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::frame::Frame;

use super::result::Detection;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_WIDTH: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const LABEL_HEIGHT: i32 = GLYPH_HEIGHT + 2;

/// Draw `detections` and a `PERSONS: N` label onto a copy of `frame`.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Result<Frame> {
    let mut image = frame.to_image()?;
    for detection in detections {
        draw_detection(&mut image, detection);
    }
    draw_text(
        &mut image,
        &format!("PERSONS: {}", detections.len()),
        10,
        10,
        TEXT_COLOR,
        Some(BOX_COLOR),
    );
    let mut annotated = Frame::from_image(image, frame.captured_at);
    annotated.fps = frame.fps;
    Ok(annotated)
}

fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let x = detection.x.round() as i32;
    let y = detection.y.round() as i32;
    let w = detection.w.round().max(1.0) as u32;
    let h = detection.h.round().max(1.0) as u32;
    draw_thick_rect(image, x, y, w, h);

    let label_y = if y >= LABEL_HEIGHT { y - LABEL_HEIGHT } else { y };
    draw_text(
        image,
        &format!("PERSON: {:.2}", detection.confidence),
        x,
        label_y,
        TEXT_COLOR,
        Some(BOX_COLOR),
    );
}

fn draw_thick_rect(image: &mut RgbImage, x: i32, y: i32, width: u32, height: u32) {
    for inset in 0..BOX_THICKNESS {
        let w = width.saturating_sub(2 * inset as u32);
        let h = height.saturating_sub(2 * inset as u32);
        if w == 0 || h == 0 {
            break;
        }
        draw_hollow_rect_mut(image, Rect::at(x + inset, y + inset).of_size(w, h), BOX_COLOR);
    }
}

/// 5x7 bitmap text, upper-cased, with an optional filled background.
pub fn draw_text(
    image: &mut RgbImage,
    text: &str,
    x: i32,
    y: i32,
    color: Rgb<u8>,
    background: Option<Rgb<u8>>,
) {
    let chars: Vec<char> = text.to_uppercase().chars().collect();
    if let Some(bg) = background {
        let width = chars.len() as u32 * GLYPH_WIDTH as u32 + 2;
        draw_filled_rect_mut(
            image,
            Rect::at(x, y).of_size(width, LABEL_HEIGHT as u32),
            bg,
        );
    }

    for (i, ch) in chars.into_iter().enumerate() {
        let origin_x = x + 1 + i as i32 * GLYPH_WIDTH;
        let origin_y = y + 1;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..5 {
                if (bits >> (4 - col)) & 1 == 0 {
                    continue;
                }
                let px = origin_x + col;
                let py = origin_y + row as i32;
                if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height()
                {
                    image.put_pixel(px as u32, py as u32, color);
                }
            }
        }
    }
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        ' ' => [0; 7],
        _ => [0b11111, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11111],
    }
}
