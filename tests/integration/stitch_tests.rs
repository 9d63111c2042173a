//! Mosaic and collage composition through the public API.

use tm_pipeline::error::{MetadataError, StitchError};
use tm_pipeline::mosaic::{StitchKind, StitchOptions};
use tm_pipeline::pixels::{ImageShift, PixelType};

use super::test_utils::{channel_image, gradient_plane, uint16_plane};

#[test]
fn test_mosaic_overlap() {
    let images = vec![
        channel_image(uint16_plane(4, 4, 1), "A01", 0, 0),
        channel_image(uint16_plane(4, 4, 2), "A01", 0, 1),
        channel_image(uint16_plane(4, 4, 3), "A01", 1, 0),
        channel_image(uint16_plane(4, 4, 4), "A01", 1, 1),
    ];
    let options = StitchOptions::new(1, 1).unwrap();
    let mosaic = StitchKind::Mosaic.create(&images, &options).unwrap();

    assert_eq!(mosaic.dimensions(), (7, 7));
    assert_eq!(mosaic.pixel_type(), PixelType::U16);
    assert!(mosaic.is_uint());
    let plane = mosaic.plane();
    assert_eq!(plane.value_at(0, 0), 1.0);
    // later images are drawn over the shared border
    assert_eq!(plane.value_at(3, 0), 2.0);
    assert_eq!(plane.value_at(0, 3), 3.0);
    assert_eq!(plane.value_at(3, 3), 4.0);
    assert_eq!(plane.value_at(6, 6), 4.0);
}

#[test]
fn test_mosaic_keeps_site_content() {
    let images = vec![
        channel_image(gradient_plane(3, 2), "B02", 0, 0),
        channel_image(gradient_plane(3, 2), "B02", 0, 1),
    ];
    let mosaic = StitchKind::Mosaic
        .create(&images, &StitchOptions::new(0, 0).unwrap())
        .unwrap();
    assert_eq!(mosaic.dimensions(), (2, 6));
    let plane = mosaic.plane();
    assert_eq!(plane.value_at(1, 1), 4.0);
    assert_eq!(plane.value_at(4, 1), 4.0);
}

#[test]
fn test_mosaic_with_gap_fails() {
    let images = vec![
        channel_image(uint16_plane(4, 4, 1), "A01", 0, 0),
        channel_image(uint16_plane(4, 4, 2), "A01", 1, 1),
    ];
    let grid = StitchKind::Mosaic.build_grid(&images).unwrap();
    assert_eq!(grid.gaps(), vec![(0, 1), (1, 0)]);

    let result = StitchKind::Mosaic.create(&images, &StitchOptions::new(0, 0).unwrap());
    assert!(matches!(result, Err(StitchError::InvalidArgument(_))));
}

#[test]
fn test_mosaic_alignment() {
    let mut image = channel_image(uint16_plane(4, 4, 9), "A01", 0, 0);
    image.metadata.shift = Some(ImageShift::new(0, 1));
    let images = vec![image];

    let plain = StitchKind::Mosaic
        .create(&images, &StitchOptions::new(0, 0).unwrap())
        .unwrap();
    assert_eq!(plain.plane().value_at(0, 0), 9.0);

    let options = StitchOptions::new(0, 0).unwrap().with_alignment(true);
    let aligned = StitchKind::Mosaic.create(&images, &options).unwrap();
    assert_eq!(aligned.dimensions(), (4, 4));
    assert_eq!(aligned.plane().value_at(0, 0), 0.0);
    assert_eq!(aligned.plane().value_at(0, 1), 9.0);
}

#[test]
fn test_collage_pads_and_spaces_cells() {
    let images = vec![
        channel_image(uint16_plane(4, 4, 1), "A01", 0, 0),
        channel_image(uint16_plane(6, 2, 2), "A02", 0, 0),
        channel_image(uint16_plane(2, 2, 3), "A03", 0, 0),
    ];
    let collage = StitchKind::Collage
        .create(&images, &StitchOptions::new(1, 1).unwrap())
        .unwrap();

    // 2x2 cells of 6x4 with one pixel spacers
    assert_eq!(collage.dimensions(), (9, 13));
    let plane = collage.plane();
    assert_eq!(plane.value_at(1, 0), 1.0);
    // spacer
    assert_eq!(plane.value_at(6, 0), 0.0);
    // A02 is centered vertically in its cell
    assert_eq!(plane.value_at(7, 0), 0.0);
    assert_eq!(plane.value_at(7, 1), 2.0);
    // A03 in the second row, centered in both directions
    assert_eq!(plane.value_at(2, 6), 3.0);
    assert_eq!(plane.value_at(1, 6), 0.0);
    // last cell is empty
    assert_eq!(plane.value_at(10, 7), 0.0);
}

#[test]
fn test_collage_rejects_mixed_channels() {
    let mut other = channel_image(uint16_plane(4, 4, 1), "A02", 0, 0);
    other.metadata.channel_name = "GFP".to_string();
    let images = vec![channel_image(uint16_plane(4, 4, 1), "A01", 0, 0), other];

    let result = StitchKind::Collage.create(&images, &StitchOptions::new(0, 0).unwrap());
    assert!(matches!(
        result,
        Err(StitchError::Metadata(MetadataError::Inconsistent(_)))
    ));
}

#[test]
fn test_empty_input() {
    for kind in [StitchKind::Mosaic, StitchKind::Collage] {
        let result = kind.create(&[], &StitchOptions::new(0, 0).unwrap());
        assert!(matches!(result, Err(StitchError::EmptyInput)), "{kind}");
    }
}
