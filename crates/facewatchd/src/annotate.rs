//! Frame annotation: outcome-coloured face boxes, landmark dots, mirroring,
//! JPEG encoding for the stream.

use facewatch_core::FaceRegion;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, Rgb, RgbImage};

pub const RECOGNISED_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
pub const INTRUDER_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
pub const LANDMARK_COLOUR: Rgb<u8> = Rgb([255, 255, 0]);

const BOX_THICKNESS: u32 = 2;
const LANDMARK_RADIUS: i32 = 2;

/// Draw the detection box for one face, green when recognised and red
/// otherwise, plus its landmarks when the localizer produced them.
pub fn draw_face(img: &mut RgbImage, region: &FaceRegion, recognised: bool) {
    let colour = if recognised {
        RECOGNISED_COLOUR
    } else {
        INTRUDER_COLOUR
    };
    let bounds = region.expanded(0, img.width(), img.height());
    if !bounds.is_empty() {
        draw_rect(
            img,
            [bounds.left, bounds.top, bounds.right - 1, bounds.bottom - 1],
            colour,
            BOX_THICKNESS,
        );
    }
    if let Some(points) = &region.landmarks {
        for &(x, y) in points {
            draw_dot(img, x.round() as i32, y.round() as i32, LANDMARK_COLOUR);
        }
    }
}

/// Rectangle border `[x0, y0, x1, y1]` (inclusive) with the given thickness.
fn draw_rect(img: &mut RgbImage, bbox: [u32; 4], colour: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    let [x0, y0, x1, y1] = bbox;
    for t in 0..thickness {
        let xx0 = x0.saturating_add(t);
        let yy0 = y0.saturating_add(t);
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 >= w || yy0 >= h || xx1 >= w || yy1 >= h || xx0 > xx1 || yy0 > yy1 {
            continue;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, colour);
            img.put_pixel(x, yy1, colour);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, colour);
            img.put_pixel(xx1, y, colour);
        }
    }
}

fn draw_dot(img: &mut RgbImage, cx: i32, cy: i32, colour: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for dy in -LANDMARK_RADIUS..=LANDMARK_RADIUS {
        for dx in -LANDMARK_RADIUS..=LANDMARK_RADIUS {
            if dx * dx + dy * dy > LANDMARK_RADIUS * LANDMARK_RADIUS {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 && x < w && y < h {
                img.put_pixel(x as u32, y as u32, colour);
            }
        }
    }
}

/// Mirror (if asked) and JPEG-encode an annotated frame.
pub fn encode_frame(mut img: RgbImage, mirror: bool, quality: u8) -> ImageResult<Vec<u8>> {
    if mirror {
        image::imageops::flip_horizontal_in_place(&mut img);
    }
    let mut jpeg = Vec::with_capacity((img.width() * img.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&img)?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(top: i32, left: i32, bottom: i32, right: i32) -> FaceRegion {
        FaceRegion {
            top,
            left,
            bottom,
            right,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_box_colour_follows_outcome() {
        let mut img = RgbImage::new(40, 40);
        draw_face(&mut img, &region(5, 5, 20, 20), true);
        assert_eq!(img.get_pixel(5, 5), &RECOGNISED_COLOUR);
        assert_eq!(img.get_pixel(19, 19), &RECOGNISED_COLOUR);
        assert_eq!(img.get_pixel(12, 12), &Rgb([0, 0, 0]));

        draw_face(&mut img, &region(22, 22, 30, 30), false);
        assert_eq!(img.get_pixel(22, 29), &INTRUDER_COLOUR);
    }

    #[test]
    fn test_box_partly_outside_frame_is_clipped() {
        let mut img = RgbImage::new(20, 20);
        draw_face(&mut img, &region(-10, -10, 50, 8), false);
        assert_eq!(img.get_pixel(0, 0), &INTRUDER_COLOUR);
        assert_eq!(img.get_pixel(7, 19), &INTRUDER_COLOUR);
    }

    #[test]
    fn test_box_entirely_outside_frame_draws_nothing() {
        let mut img = RgbImage::new(20, 20);
        draw_face(&mut img, &region(30, 30, 40, 40), true);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_landmarks_drawn_and_clipped() {
        let mut img = RgbImage::new(20, 20);
        let mut r = region(0, 0, 0, 0);
        r.landmarks = Some([(10.0, 10.0), (0.0, 0.0), (19.4, 19.4), (-50.0, 3.0), (3.0, 99.0)]);
        draw_face(&mut img, &r, true);
        assert_eq!(img.get_pixel(10, 10), &LANDMARK_COLOUR);
        assert_eq!(img.get_pixel(12, 10), &LANDMARK_COLOUR);
        assert_eq!(img.get_pixel(19, 19), &LANDMARK_COLOUR);
    }

    #[test]
    fn test_encode_frame_mirrors() {
        let mut img = RgbImage::new(16, 8);
        for y in 0..8 {
            img.put_pixel(0, y, Rgb([255, 255, 255]));
        }
        let jpeg = encode_frame(img, true, 95).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert!(decoded.get_pixel(15, 4)[0] > decoded.get_pixel(0, 4)[0]);
    }
}
