mod common;

use std::fs;
use std::rc::Rc;

use common::{pyramid_description, MockBackend, TestCamera};
use glam::Vec3;
use image::{GrayImage, Luma};
use medea_terrain::{
    load_description, CameraId, Error, ImageFileSource, ShaderConstant, TerrainCamera,
    TerrainNode, TerrainSettings,
};
use tempfile::tempdir;

#[test]
fn relative_paths_resolve_against_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("island.json");
    fs::write(&path, pyramid_description(16, 4, [1.0, 10.0, 1.0])).unwrap();

    let desc = load_description(&path).unwrap();
    let root = dir.path().to_string_lossy().to_string();
    assert_eq!(desc.url_root.as_deref(), Some(root.as_str()));
    assert_eq!(desc.lod_count(), 5);
}

#[test]
fn missing_or_invalid_files_are_errors() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.json");
    assert!(matches!(load_description(&missing), Err(Error::Loading(_))));

    let bad = dir.path().join("bad.json");
    fs::write(&bad, r#"{"size": [100, 64], "unitbase": 8, "scale": [1,1,1]}"#).unwrap();
    assert!(matches!(load_description(&bad), Err(Error::Config(_))));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ size: ").unwrap();
    assert!(load_description(&broken).is_err());
}

#[test]
fn node_streams_images_from_disk() {
    let dir = tempdir().unwrap();
    for (lod, size) in [16u32, 8, 4, 2, 1].into_iter().enumerate() {
        let px = size * 4;
        GrayImage::from_pixel(px, px, Luma([51]))
            .save(dir.path().join(format!("hm{lod}.png")))
            .unwrap();
    }
    let path = dir.path().join("island.json");
    fs::write(&path, pyramid_description(16, 4, [1.0, 10.0, 1.0])).unwrap();

    let settings = TerrainSettings {
        use_worker: false,
        ..Default::default()
    };
    let mut node = TerrainNode::load("island", &path, settings).unwrap();
    let mut backend = MockBackend::default();
    let mut source = ImageFileSource;
    let view: Rc<dyn TerrainCamera> = Rc::new(TestCamera::new(1, Vec3::ZERO));
    node.active_entities(&view);

    let mut frames = 0;
    while frames < 2000 && node.world_height(0.0, 0.0).is_none() {
        node.update(&mut backend, &mut source).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
        frames += 1;
    }
    let h = node.world_height(0.0, 0.0).unwrap();
    assert!((h - 2.0).abs() < 1e-4, "{h}");

    let ring = node.rings(CameraId(1)).unwrap().ring(0).unwrap();
    let pass = &ring.material().unwrap().passes()[0];
    let expected = format!("{}/grass.png", dir.path().to_string_lossy());
    assert!(matches!(pass.get("diffuse"), Some(ShaderConstant::Texture(p)) if *p == expected));
}
