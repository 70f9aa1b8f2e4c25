//! End-to-end pipeline tests on a headless device. Each test is skipped when
//! the machine has no GPU adapter.

use color::{Hsv, Rgb, ToneSamples};
use image::{Rgba, RgbaImage};
use renderer::{
    read_texture, ContextOptions, CpuFrame, DisplaySurface, EngineConfig, GpuContext,
    MaskPreviewSource, RendererError, RetouchEngine, RetouchParameters, ViewMode, ViewportState,
    ViewportTransform,
};

fn engine_with(test: &str, config: EngineConfig) -> Option<(GpuContext, RetouchEngine)> {
    let context = match GpuContext::headless(&ContextOptions::default()) {
        Ok(context) => context,
        Err(RendererError::NoAdapter) => {
            eprintln!("skipping {test}: no GPU adapter available");
            return None;
        }
        Err(err) => panic!("device: {err}"),
    };
    let engine = RetouchEngine::new(&context, config).expect("engine");
    Some((context, engine))
}

fn engine(test: &str) -> Option<(GpuContext, RetouchEngine)> {
    engine_with(test, EngineConfig::default())
}

fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 255 / width) as u8,
            (y * 255 / height) as u8,
            ((x * 37 + y * 91) % 256) as u8,
            255,
        ])
    })
}

fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([rgb[0], rgb[1], rgb[2], 255]))
}

fn tones_of(rgb: [u8; 3]) -> ToneSamples {
    let mut tones = ToneSamples::new();
    tones.push_rgb(Rgb::from_rgb8(rgb[0], rgb[1], rgb[2]));
    tones
}

fn assert_frame_near(frame: &CpuFrame, image: &RgbaImage, tolerance: u8) {
    assert_eq!((frame.width, frame.height), image.dimensions());
    for (i, (got, want)) in frame.pixels.iter().zip(image.as_raw()).enumerate() {
        assert!(
            got.abs_diff(*want) <= tolerance,
            "byte {i}: got {got}, want {want}"
        );
    }
}

fn display_texture(context: &GpuContext, width: u32, height: u32) -> wgpu::Texture {
    context.device().create_texture(&wgpu::TextureDescriptor {
        label: Some("test.display"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

#[test]
fn zero_tones_reproduce_original() {
    let Some((_context, mut engine)) = engine("zero_tones_reproduce_original") else {
        return;
    };
    let image = gradient(16, 8);
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 6.0,
        detail_amount: 0.0,
        ..Default::default()
    };
    assert!(engine.render_to_buffer(&params).unwrap().is_some());
    let frame = engine.read_pixels().unwrap();
    assert_frame_near(&frame, &image, 0);
}

#[test]
fn zero_sigma_low_frequency_is_identity() {
    let Some((_context, mut engine)) = engine("zero_sigma_low_frequency_is_identity") else {
        return;
    };
    let image = gradient(9, 7);
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 0.05,
        view_mode: ViewMode::LowFrequency,
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    assert_frame_near(&engine.read_pixels().unwrap(), &image, 0);
}

#[test]
fn low_frequency_view_keeps_alpha() {
    let Some((_context, mut engine)) = engine("low_frequency_view_keeps_alpha") else {
        return;
    };
    let image = RgbaImage::from_pixel(4, 4, Rgba([100, 80, 60, 128]));
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 0.0,
        view_mode: ViewMode::LowFrequency,
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    let frame = engine.read_pixels().unwrap();
    assert_eq!(frame.pixel(2, 1), Some([100, 80, 60, 128]));
    assert_frame_near(&frame, &image, 0);
}

#[test]
fn full_detail_under_full_mask_keeps_original() {
    let Some((_context, mut engine)) = engine("full_detail_under_full_mask_keeps_original") else {
        return;
    };
    let image = gradient(12, 12);
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 3.0,
        color_tolerance: 1.0,
        detail_amount: 1.0,
        skin_tones: tones_of([200, 150, 120]),
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    assert_frame_near(&engine.read_pixels().unwrap(), &image, 1);
}

#[test]
fn solid_skin_patch_is_unchanged() {
    let Some((_context, mut engine)) = engine("solid_skin_patch_is_unchanged") else {
        return;
    };
    let skin = [128, 100, 90];
    let image = solid(4, 4, skin);
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 0.0,
        color_tolerance: 0.5,
        detail_amount: 0.0,
        skin_tones: tones_of(skin),
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    assert_frame_near(&engine.read_pixels().unwrap(), &image, 0);
}

#[test]
fn smoothing_spreads_isolated_detail() {
    let Some((_context, mut engine)) = engine("smoothing_spreads_isolated_detail") else {
        return;
    };
    let mut image = solid(9, 9, [120, 90, 80]);
    image.put_pixel(4, 4, Rgba([250, 250, 250, 255]));
    engine.set_image(&image).unwrap();

    let params = RetouchParameters {
        smoothness: 1.5,
        color_tolerance: 1.0,
        detail_amount: 0.0,
        skin_tones: tones_of([120, 90, 80]),
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    let frame = engine.read_pixels().unwrap();

    let centre = frame.pixel(4, 4).unwrap();
    let neighbour = frame.pixel(5, 4).unwrap();
    assert!(centre[0] < 250, "centre should be smoothed, got {centre:?}");
    assert!(neighbour[0] > 120, "neighbour should pick up detail, got {neighbour:?}");
    assert_eq!(frame.pixel(0, 0).unwrap(), [120, 90, 80, 255]);
}

#[test]
fn high_frequency_view_of_flat_image_is_mid_grey() {
    let Some((_context, mut engine)) = engine("high_frequency_view_of_flat_image_is_mid_grey")
    else {
        return;
    };
    engine.set_image(&solid(6, 6, [40, 180, 90])).unwrap();
    let params = RetouchParameters {
        smoothness: 2.0,
        view_mode: ViewMode::HighFrequency,
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();
    let frame = engine.read_pixels().unwrap();
    for texel in frame.pixels.chunks_exact(4) {
        for channel in &texel[..3] {
            assert!(channel.abs_diff(128) <= 1, "got {texel:?}");
        }
        assert_eq!(texel[3], 255);
    }
}

#[test]
fn readback_rows_are_top_down() {
    let Some((_context, mut engine)) = engine("readback_rows_are_top_down") else {
        return;
    };
    let image = RgbaImage::from_fn(3, 4, |_, y| {
        if y == 0 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([0, 0, 255, 255])
        }
    });
    engine.set_image(&image).unwrap();
    engine.render_to_buffer(&RetouchParameters::default()).unwrap();
    let frame = engine.read_pixels().unwrap();
    assert_eq!(frame.pixel(1, 0), Some([255, 0, 0, 255]));
    assert_eq!(frame.pixel(1, 3), Some([0, 0, 255, 255]));
}

#[test]
fn same_size_image_reuses_pool() {
    let Some((_context, mut engine)) = engine("same_size_image_reuses_pool") else {
        return;
    };
    engine.set_image(&gradient(10, 6)).unwrap();
    let generation = engine.pool().unwrap().generation();

    engine.set_image(&solid(10, 6, [1, 2, 3])).unwrap();
    assert_eq!(engine.pool().unwrap().generation(), generation);

    engine.set_image(&solid(6, 10, [1, 2, 3])).unwrap();
    assert_eq!(engine.pool().unwrap().generation(), generation + 1);
    assert_eq!(engine.size(), Some((6, 10)));
}

#[test]
fn sample_pixel_reads_original_texel() {
    let Some((_context, mut engine)) = engine("sample_pixel_reads_original_texel") else {
        return;
    };
    let mut image = solid(5, 5, [10, 20, 30]);
    image.put_pixel(3, 1, Rgba([128, 100, 90, 255]));
    engine.set_image(&image).unwrap();

    // A render in between must not affect what is sampled.
    let params = RetouchParameters {
        view_mode: ViewMode::HighFrequency,
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();

    assert_eq!(engine.sample_pixel(3, 1).unwrap().to_rgb8(), [128, 100, 90]);
    assert_eq!(engine.sample_pixel(0, 4).unwrap().to_rgb8(), [10, 20, 30]);

    let tone = engine.sample_tone(3, 1).unwrap();
    let expected = Rgb::from_rgb8(128, 100, 90).to_hsv();
    assert!((tone.h - expected.h).abs() < 1e-6);
}

#[test]
fn out_of_bounds_sample_is_black() {
    let Some((_context, mut engine)) = engine("out_of_bounds_sample_is_black") else {
        return;
    };
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), Rgb::BLACK);
    engine.set_image(&solid(4, 4, [200, 200, 200])).unwrap();
    assert_eq!(engine.sample_pixel(4, 0).unwrap(), Rgb::BLACK);
    assert_eq!(engine.sample_pixel(0, 99).unwrap(), Rgb::BLACK);
}

#[test]
fn calls_before_set_image_are_ignored() {
    let Some((context, mut engine)) = engine("calls_before_set_image_are_ignored") else {
        return;
    };
    assert!(engine
        .render_to_buffer(&RetouchParameters::default())
        .unwrap()
        .is_none());
    let frame = engine.read_pixels().unwrap();
    assert_eq!((frame.width, frame.height), (0, 0));

    let texture = display_texture(&context, 4, 4);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width: 4,
        height: 4,
    };
    engine
        .render_to_display(&RetouchParameters::default(), &surface)
        .unwrap();
    engine.draw_mask_preview(&surface, 0, 0, 2, 2).unwrap();
}

#[test]
fn display_render_letterboxes_with_background() {
    let Some((context, mut engine)) = engine("display_render_letterboxes_with_background") else {
        return;
    };
    engine.set_image(&solid(8, 8, [200, 60, 20])).unwrap();

    let (width, height) = (32, 16);
    let texture = display_texture(&context, width, height);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width,
        height,
    };

    let transform = ViewportTransform::new((width, height), (8, 8), &ViewportState::default());
    let params = RetouchParameters {
        transform: transform.matrix(),
        ..Default::default()
    };
    engine.render_to_display(&params, &surface).unwrap();

    let frame = read_texture(context.device(), context.queue(), &texture).unwrap();
    let background = frame.pixel(1, 8).unwrap();
    for channel in &background[..3] {
        assert!(channel.abs_diff(26) <= 1, "background {background:?}");
    }
    assert_eq!(frame.pixel(16, 8), Some([200, 60, 20, 255]));
    assert_eq!(transform.pointer_to_texel(16.5, 8.5), Some((4, 4)));
}

#[test]
fn mask_preview_shows_classified_region() {
    let Some((context, mut engine)) = engine("mask_preview_shows_classified_region") else {
        return;
    };
    let skin = [190, 140, 120];
    let image = RgbaImage::from_fn(8, 8, |x, _| {
        if x < 4 {
            Rgba([skin[0], skin[1], skin[2], 255])
        } else {
            Rgba([30, 60, 200, 255])
        }
    });
    engine.set_image(&image).unwrap();
    let params = RetouchParameters {
        color_tolerance: 0.05,
        skin_tones: tones_of(skin),
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();

    let texture = display_texture(&context, 8, 8);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width: 8,
        height: 8,
    };
    engine.draw_mask_preview(&surface, 0, 0, 8, 8).unwrap();

    let frame = read_texture(context.device(), context.queue(), &texture).unwrap();
    assert_eq!(frame.pixel(1, 3), Some([255, 255, 255, 255]));
    assert_eq!(frame.pixel(6, 3), Some([0, 0, 0, 255]));
}

#[test]
fn soft_mask_feathers_the_skin_edge() {
    let Some((context, mut engine)) = engine_with(
        "soft_mask_feathers_the_skin_edge",
        EngineConfig {
            mask_preview: MaskPreviewSource::Soft,
            ..Default::default()
        },
    ) else {
        return;
    };
    let skin = [190, 140, 120];
    let image = RgbaImage::from_fn(16, 4, |x, _| {
        if x < 8 {
            Rgba([skin[0], skin[1], skin[2], 255])
        } else {
            Rgba([30, 60, 200, 255])
        }
    });
    engine.set_image(&image).unwrap();
    let params = RetouchParameters {
        color_tolerance: 0.05,
        mask_blur_radius: 2.0,
        skin_tones: tones_of(skin),
        ..Default::default()
    };
    engine.render_to_buffer(&params).unwrap();

    let texture = display_texture(&context, 16, 4);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width: 16,
        height: 4,
    };
    engine.draw_mask_preview(&surface, 0, 0, 16, 4).unwrap();
    let frame = read_texture(context.device(), context.queue(), &texture).unwrap();

    let row: Vec<u8> = (0..16).map(|x| frame.pixel(x, 2).unwrap()[0]).collect();
    assert_eq!(row[0], 255, "row {row:?}");
    assert_eq!(row[15], 0, "row {row:?}");
    assert!(row.windows(2).all(|pair| pair[0] >= pair[1]), "row {row:?}");
    for x in [6, 7, 8, 9] {
        assert!(row[x] > 0 && row[x] < 255, "column {x} not feathered: {row:?}");
    }
}

#[test]
fn mask_preview_outside_surface_draws_nothing() {
    let Some((context, mut engine)) = engine_with(
        "mask_preview_outside_surface_draws_nothing",
        EngineConfig {
            mask_preview: MaskPreviewSource::Soft,
            ..Default::default()
        },
    ) else {
        return;
    };
    engine.set_image(&solid(4, 4, [128, 100, 90])).unwrap();
    let params = RetouchParameters {
        color_tolerance: 0.5,
        skin_tones: tones_of([128, 100, 90]),
        ..Default::default()
    };

    let texture = display_texture(&context, 8, 8);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width: 8,
        height: 8,
    };
    engine.render_to_display(&params, &surface).unwrap();
    let before = read_texture(context.device(), context.queue(), &texture).unwrap();

    engine.draw_mask_preview(&surface, 8, 0, 4, 4).unwrap();
    engine.draw_mask_preview(&surface, -4, -4, 4, 4).unwrap();
    let after = read_texture(context.device(), context.queue(), &texture).unwrap();
    assert_eq!(before, after);

    // A partially visible rectangle only touches its visible part.
    engine.draw_mask_preview(&surface, -2, -2, 4, 4).unwrap();
    let partial = read_texture(context.device(), context.queue(), &texture).unwrap();
    assert_eq!(partial.pixel(0, 0), Some([255, 255, 255, 255]));
    assert_eq!(partial.pixel(3, 3), before.pixel(3, 3));
}

#[test]
fn dispose_is_idempotent() {
    let Some((_context, mut engine)) = engine("dispose_is_idempotent") else {
        return;
    };
    engine.set_image(&solid(4, 4, [1, 2, 3])).unwrap();
    engine.dispose();
    engine.dispose();
    assert!(engine.is_disposed());
    assert_eq!(engine.size(), None);

    engine.set_image(&solid(4, 4, [1, 2, 3])).unwrap();
    assert!(engine
        .render_to_buffer(&RetouchParameters::default())
        .unwrap()
        .is_none());
    assert_eq!(engine.sample_pixel(0, 0).unwrap(), Rgb::BLACK);
}

#[test]
fn evicted_tone_no_longer_selects() {
    let Some((context, mut engine)) = engine("evicted_tone_no_longer_selects") else {
        return;
    };
    let skin = [128, 100, 90];
    engine.set_image(&solid(4, 4, skin)).unwrap();

    let texture = display_texture(&context, 4, 4);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width: 4,
        height: 4,
    };
    let preview_mask = |engine: &mut RetouchEngine, params: &RetouchParameters| {
        engine.render_to_buffer(params).unwrap();
        engine.draw_mask_preview(&surface, 0, 0, 4, 4).unwrap();
        read_texture(context.device(), context.queue(), &texture)
            .unwrap()
            .pixel(2, 2)
    };

    let mut params = RetouchParameters {
        color_tolerance: 0.02,
        ..Default::default()
    };
    params
        .skin_tones
        .push_rgb(Rgb::from_rgb8(skin[0], skin[1], skin[2]));
    assert_eq!(preview_mask(&mut engine, &params), Some([255, 255, 255, 255]));

    // Ten unrelated tones push the matching sample out of the buffer.
    for i in 0..10 {
        params
            .skin_tones
            .push(Hsv::new(0.5 + i as f32 * 0.01, 0.9, 0.9));
    }
    assert_eq!(params.skin_tones.len(), 10);
    assert_eq!(preview_mask(&mut engine, &params), Some([0, 0, 0, 255]));
}
