#![allow(missing_docs)]

use std::sync::Arc;

use extmap::primitives::io::{FileIo, MemFileIo};
use extmap::storage::extent::{Extent, ExtentTree, MapRequest};
use extmap::storage::volume::VolumeOptions;
use extmap::types::EXT_MAX_BLOCKS;
use extmap::{Config, Volume};

fn volume(block_size: u32, block_count: u64) -> Volume {
    let mut config = Config::default();
    config.volume = VolumeOptions {
        block_size,
        block_count,
        inode_count: 8,
        ..VolumeOptions::default()
    };
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::default());
    Volume::format(io, &config).expect("format volume")
}

fn assert_contiguous(extents: &[Extent]) {
    for pair in extents.windows(2) {
        assert!(
            pair[0].end() <= u64::from(pair[1].logical),
            "overlap between {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn create_then_lookup_on_empty_file() {
    let volume = volume(1024, 4096);
    let mut tree = volume.create_file().unwrap();
    assert_eq!(tree.depth(), 0);
    assert!(tree.extents().unwrap().is_empty());

    let created = tree.map_range(MapRequest::create(0, 10)).unwrap();
    assert_eq!(created.len, 10);
    assert!(created.flags.new && created.flags.mapped);
    assert_eq!(
        tree.extents().unwrap(),
        vec![Extent::new(0, 10, created.physical)]
    );

    let found = tree.map_range(MapRequest::lookup(0, 10)).unwrap();
    assert_eq!(found.physical, created.physical);
    assert_eq!(found.len, 10);
    assert!(!found.flags.new);
}

#[test]
fn direct_write_into_preallocated_range_isolates_it() {
    let volume = volume(1024, 4096);
    let mut tree = volume.create_file().unwrap();
    tree.fallocate(0, 100, false).unwrap();
    let base = tree.extents().unwrap()[0].physical;

    let map = tree
        .map_range(MapRequest::create_uninitialized(40, 20).pre_io())
        .unwrap();
    assert_eq!((map.logical, map.len, map.physical), (40, 20, base + 40));
    assert!(map.needs_conversion);
    assert!(tree.has_pending_conversion());

    tree.convert_unwritten(40, 20).unwrap();
    assert_eq!(
        tree.extents().unwrap(),
        vec![
            Extent::new_unwritten(0, 40, base),
            Extent::new(40, 20, base + 40),
            Extent::new_unwritten(60, 40, base + 60),
        ]
    );
    tree.verify().unwrap();
}

#[test]
fn full_root_grows_and_keeps_every_mapping() {
    let volume = volume(1024, 8192);
    let mut tree = volume.create_file().unwrap();
    let mut mapped = Vec::new();
    // Gaps keep allocations from merging.
    for i in 0..200u32 {
        let map = tree.map_range(MapRequest::create(i * 4, 2)).unwrap();
        mapped.push((i * 4, map.physical));
    }
    assert!(tree.depth() >= 1);
    for (lblk, physical) in &mapped {
        let (found, _) = tree.lookup(*lblk).unwrap().expect("still mapped");
        assert_eq!(found, *physical);
        let (next, _) = tree.lookup(*lblk + 1).unwrap().expect("second block");
        assert_eq!(next, *physical + 1);
        assert!(tree.lookup(*lblk + 2).unwrap().is_none());
    }
    let report = tree.verify().unwrap();
    assert_eq!(report.extents, 200);
    assert_contiguous(&tree.extents().unwrap());
}

#[test]
fn removing_everything_collapses_the_tree() {
    let volume = volume(1024, 8192);
    let free_before = volume.allocator().free_clusters();
    let mut tree = volume.create_file().unwrap();
    for i in 0..300u32 {
        tree.map_range(MapRequest::create(i * 3, 1)).unwrap();
    }
    assert!(tree.depth() >= 1);

    tree.remove_range(0, EXT_MAX_BLOCKS - 1).unwrap();
    assert_eq!(tree.depth(), 0);
    assert!(tree.extents().unwrap().is_empty());
    assert_eq!(volume.allocator().free_clusters(), free_before);
}

#[test]
fn reopened_tree_reads_the_same_extents() {
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::default());
    let mut config = Config::default();
    config.volume.block_size = 1024;
    config.volume.block_count = 4096;

    let (ino, before) = {
        let volume = Volume::format(io.clone(), &config).unwrap();
        let mut tree = volume.create_file().unwrap();
        for i in 0..120u32 {
            tree.map_range(MapRequest::create(i * 5, 3)).unwrap();
        }
        tree.punch_hole(100, 200).unwrap();
        volume.store_file(&tree).unwrap();
        volume.commit().unwrap();
        (tree.ino(), tree.extents().unwrap())
    };

    let volume = Volume::open(io, &config).unwrap();
    let tree: ExtentTree = volume.open_file(ino).unwrap();
    assert_eq!(tree.extents().unwrap(), before);
    tree.verify().unwrap();
}

#[test]
fn fiemap_marks_last_and_unwritten() {
    let volume = volume(1024, 4096);
    let mut tree = volume.create_file().unwrap();
    tree.map_range(MapRequest::create(0, 8)).unwrap();
    tree.fallocate(20, 8, false).unwrap();

    let items = tree.fiemap(0, u32::MAX).unwrap();
    assert_eq!(items.len(), 2);
    assert!(!items[0].flags.unwritten && !items[0].flags.last);
    assert!(items[1].flags.unwritten && items[1].flags.last);
    assert_eq!((items[1].logical, items[1].len), (20, 8));
}
