use std::io::Cursor;

use image::{ImageOutputFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Square canvas edge in pixels.
pub const AVATAR_SIZE: u32 = 200;

/// Rendered default avatar, ready to be persisted by the file manager.
#[derive(Debug, Clone)]
pub struct GeneratedAvatar {
    pub bytes: Vec<u8>,
    pub ext: &'static str,
}

/// Renders the default avatar for `username`: the uppercase first character,
/// white and centred, on a square filled with a colour derived from a stable
/// hash of the username. Same username, same image.
pub fn generate(username: &str) -> Result<GeneratedAvatar, AppError> {
    let background = background_color(username);
    let letter = username
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('_');

    let mut img = RgbImage::from_pixel(AVATAR_SIZE, AVATAR_SIZE, background);
    draw_letter(&mut img, letter);

    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode avatar: {}", e)))?;

    Ok(GeneratedAvatar { bytes, ext: "png" })
}

fn background_color(username: &str) -> Rgb<u8> {
    let digest = Sha256::digest(username.as_bytes());
    Rgb([digest[0], digest[1], digest[2]])
}

/// 5x7 block glyphs covering the username alphabet. Each row uses the low
/// five bits, most significant bit leftmost. No font files needed, and the
/// centring math stays exact.
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

fn glyph(c: char) -> [u8; 7] {
    match c {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
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
        // Usernames only allow [A-Za-z0-9_], so this arm covers '_' plus
        // anything unexpected.
        _ => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
    }
}

fn draw_letter(img: &mut RgbImage, letter: char) {
    let rows = glyph(letter);

    // Scale the glyph to roughly 70% of the canvas height, then centre it.
    let scale = AVATAR_SIZE * 7 / 10 / GLYPH_HEIGHT;
    let width = GLYPH_WIDTH * scale;
    let height = GLYPH_HEIGHT * scale;
    let x0 = (AVATAR_SIZE - width) / 2;
    let y0 = (AVATAR_SIZE - height) / 2;

    let white = Rgb([255u8, 255, 255]);
    for (row, bits) in rows.iter().enumerate() {
        for col in 0..GLYPH_WIDTH {
            if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                continue;
            }
            let px = x0 + col * scale;
            let py = y0 + row as u32 * scale;
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(px + dx, py + dy, white);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn produces_png_bytes() {
        let avatar = generate("alice").unwrap();
        assert_eq!(avatar.ext, "png");
        assert_eq!(&avatar.bytes[..8], &PNG_MAGIC);
    }

    #[test]
    fn same_username_same_image() {
        let a = generate("alice").unwrap();
        let b = generate("alice").unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn different_usernames_different_backgrounds() {
        assert_ne!(background_color("alice"), background_color("bob"));
    }

    #[test]
    fn letter_is_rendered_in_white() {
        let avatar = generate("alice").unwrap();
        let img = image::load_from_memory(&avatar.bytes).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (AVATAR_SIZE, AVATAR_SIZE));
        // 'A' has its crossbar through the middle of the canvas.
        let white = img
            .pixels()
            .filter(|p| p.0 == [255, 255, 255])
            .count();
        assert!(white > 0);
        // Corners stay background-coloured.
        assert_eq!(*img.get_pixel(0, 0), background_color("alice"));
    }

    #[test]
    fn lowercase_first_letter_is_uppercased() {
        // 'a' and 'A' render the same glyph; only the background hash differs.
        let lower = generate("alice").unwrap();
        let upper = generate("Alice").unwrap();
        assert_ne!(lower.bytes, upper.bytes);
    }
}
