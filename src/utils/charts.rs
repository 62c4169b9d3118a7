//! Confusion matrix heatmaps
//!
//! Renders a [`ConfusionMatrix`] as an annotated RGB heatmap: one cell per
//! (true, predicted) grade pair, shaded by count, with the count written in
//! the cell and grade indices along the top and left edges. Text uses a
//! built-in 3x5 digit font so rendering needs nothing beyond `image`.

use image::{Rgb, RgbImage};

use crate::utils::metrics::ConfusionMatrix;

/// Edge length of rendered confusion matrices
pub const CM_IMAGE_SIZE: u32 = 512;

const COLOR_BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const COLOR_AXIS_TEXT: Rgb<u8> = Rgb([44, 62, 80]);
const COLOR_GRID: Rgb<u8> = Rgb([236, 240, 241]);
/// Zero counts
const COLOR_LOW: Rgb<u8> = Rgb([26, 12, 48]);
/// Largest count
const COLOR_HIGH: Rgb<u8> = Rgb([250, 225, 200]);

/// 3x5 glyphs for 0-9, one row per entry, bit 2 = left column
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

/// Render `cm` as a `size` x `size` RGB heatmap
pub fn render_confusion_matrix(cm: &ConfusionMatrix, size: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(size, size, COLOR_BACKGROUND);
    let k = cm.num_classes.max(1) as u32;

    let margin = size / 8;
    let grid = size.saturating_sub(margin + size / 32);
    let cell = (grid / k).max(1);
    let max_count = cm.max_count().max(1) as f32;

    for row in 0..k {
        for col in 0..k {
            let count = cm.get(row as usize, col as usize);
            let color = lerp_color(COLOR_LOW, COLOR_HIGH, count as f32 / max_count);
            let x0 = margin + col * cell;
            let y0 = margin + row * cell;

            fill_rect(&mut img, x0, y0, cell, cell, color);
            // 1px separator on the right and bottom edges
            fill_rect(&mut img, x0 + cell.saturating_sub(1), y0, 1, cell, COLOR_GRID);
            fill_rect(&mut img, x0, y0 + cell.saturating_sub(1), cell, 1, COLOR_GRID);

            let text_color = if luminance(color) > 128.0 {
                COLOR_LOW
            } else {
                COLOR_HIGH
            };
            draw_number_centered(&mut img, count, x0 + cell / 2, y0 + cell / 2, cell, text_color);
        }
    }

    // predicted grades across the top, true grades down the left
    for idx in 0..k {
        let center = margin + idx * cell + cell / 2;
        draw_number_centered(&mut img, idx as usize, center, margin / 2, margin, COLOR_AXIS_TEXT);
        draw_number_centered(&mut img, idx as usize, margin / 2, center, margin, COLOR_AXIS_TEXT);
    }

    img
}

fn lerp_color(low: Rgb<u8>, high: Rgb<u8>, t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
    Rgb([mix(low[0], high[0]), mix(low[1], high[1]), mix(low[2], high[2])])
}

fn luminance(color: Rgb<u8>) -> f32 {
    0.299 * color[0] as f32 + 0.587 * color[1] as f32 + 0.114 * color[2] as f32
}

fn fill_rect(img: &mut RgbImage, x0: u32, y0: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = (x0 + width).min(img.width());
    let y_end = (y0 + height).min(img.height());
    for y in y0..y_end {
        for x in x0..x_end {
            img.put_pixel(x, y, color);
        }
    }
}

/// Write `value` centred on (cx, cy), scaled to fit inside a `box_size` square
fn draw_number_centered(img: &mut RgbImage, value: usize, cx: u32, cy: u32, box_size: u32, color: Rgb<u8>) {
    let digits: Vec<usize> = value
        .to_string()
        .bytes()
        .map(|b| (b - b'0') as usize)
        .collect();
    let n = digits.len() as u32;

    // each glyph is 3 units wide plus 1 unit spacing
    let text_units = 4 * n - 1;
    let scale = (box_size * 3 / 5 / text_units).min(box_size / 10).max(1);

    let width = text_units * scale;
    let height = 5 * scale;
    let left = cx.saturating_sub(width / 2);
    let top = cy.saturating_sub(height / 2);

    for (i, &digit) in digits.iter().enumerate() {
        let gx = left + i as u32 * 4 * scale;
        for (row, bits) in DIGITS[digit].iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) != 0 {
                    fill_rect(img, gx + col * scale, top + row as u32 * scale, scale, scale, color);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_size() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1, 1, 2], &[0, 1, 2, 2], 6);
        let img = render_confusion_matrix(&cm, CM_IMAGE_SIZE);
        assert_eq!(img.dimensions(), (512, 512));
    }

    #[test]
    fn test_cell_shading_follows_counts() {
        let mut cm = ConfusionMatrix::new(2);
        for _ in 0..9 {
            cm.add(0, 0);
        }
        let img = render_confusion_matrix(&cm, 256);

        let margin = 256 / 8;
        let cell = (256 - margin - 256 / 32) / 2;
        // sample near the cell corner, away from the digits
        let hot = *img.get_pixel(margin + 2, margin + 2);
        let cold = *img.get_pixel(margin + cell + 2, margin + cell + 2);
        assert_eq!(hot, COLOR_HIGH);
        assert_eq!(cold, COLOR_LOW);
    }

    #[test]
    fn test_empty_matrix_renders() {
        let img = render_confusion_matrix(&ConfusionMatrix::new(6), 512);
        assert_eq!(img.width(), 512);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let cm = ConfusionMatrix::from_predictions(&[3, 3, 5], &[3, 4, 5], 6);
        let a = render_confusion_matrix(&cm, 128);
        let b = render_confusion_matrix(&cm, 128);
        assert_eq!(a.as_raw(), b.as_raw());
    }
}
