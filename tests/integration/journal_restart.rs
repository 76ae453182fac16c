#![allow(missing_docs)]

use std::sync::Arc;

use extmap::primitives::io::{FileIo, MemFileIo};
use extmap::primitives::journal::JournalOptions;
use extmap::storage::extent::MapRequest;
use extmap::types::{ExtentError, EXT_MAX_BLOCKS};
use extmap::{Config, Volume};

fn volume_with_restarts(restart_every: u32) -> Volume {
    let mut config = Config::default();
    config.volume.block_size = 1024;
    config.volume.block_count = 8192;
    config.journal = JournalOptions {
        restart_every,
        ..JournalOptions::default()
    };
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::default());
    Volume::format(io, &config).expect("format volume")
}

/// Issues `req` until the journal stops asking for a restart.
fn map_with_retry(tree: &mut extmap::ExtentTree, req: MapRequest) -> extmap::BlockMap {
    for _ in 0..8 {
        match tree.map_range(req) {
            Ok(map) => return map,
            Err(ExtentError::Retry) => continue,
            Err(err) => panic!("mapping failed: {err}"),
        }
    }
    panic!("journal kept restarting");
}

#[test]
fn retried_mapping_leaves_the_tree_untouched() {
    let volume = volume_with_restarts(2);
    let mut tree = volume.create_file().unwrap();
    let free = volume.allocator().free_clusters();

    // The second extension in this transaction is the forced restart.
    tree.map_range(MapRequest::create(0, 4)).unwrap();
    let err = tree.map_range(MapRequest::create(10, 4)).unwrap_err();
    assert!(matches!(err, ExtentError::Retry));
    assert_eq!(tree.extents().unwrap().len(), 1);
    assert_eq!(volume.allocator().free_clusters(), free - 4);
    assert_eq!(volume.journal().restarts(), 1);

    let map = map_with_retry(&mut tree, MapRequest::create(10, 4));
    assert_eq!(map.len, 4);
    tree.verify().unwrap();
}

#[test]
fn fallocate_absorbs_restarts() {
    let volume = volume_with_restarts(3);
    let mut tree = volume.create_file().unwrap();
    // Interleaved written blocks force one mapping call per gap.
    for i in 0..40u32 {
        map_with_retry(&mut tree, MapRequest::create(i * 8, 1));
    }
    let allocated = tree.fallocate(0, 40 * 8, false).unwrap();
    assert_eq!(allocated, 40 * 7);
    assert!(volume.journal().restarts() > 0);
    assert_eq!(tree.size_blocks(), 320);

    let report = tree.verify().unwrap();
    assert_eq!(report.mapped_blocks, 320);
    assert_eq!(report.unwritten_blocks, 280);

    tree.convert_unwritten(0, 320).unwrap();
    assert_eq!(tree.verify().unwrap().unwritten_blocks, 0);
}

#[test]
fn removal_resumes_after_restarts() {
    let volume = volume_with_restarts(8);
    let mut tree = volume.create_file().unwrap();
    let free = volume.allocator().free_clusters();
    for i in 0..24u32 {
        map_with_retry(&mut tree, MapRequest::create(i * 3, 2));
    }
    assert!(tree.depth() >= 1);

    tree.remove_range(0, EXT_MAX_BLOCKS - 1).unwrap();
    assert!(tree.extents().unwrap().is_empty());
    assert_eq!(tree.depth(), 0);
    assert_eq!(volume.allocator().free_clusters(), free);
    assert!(volume.stats().snapshot().restarts > 0);
}

#[test]
fn commit_persists_state_between_restarts() {
    let volume = volume_with_restarts(5);
    let mut tree = volume.create_file().unwrap();
    tree.fallocate(0, 64, false).unwrap();
    tree.punch_hole(16, 16).unwrap();
    volume.store_file(&tree).unwrap();
    volume.commit().unwrap();

    let reopened = volume.open_file(tree.ino()).unwrap();
    assert_eq!(reopened.extents().unwrap(), tree.extents().unwrap());
    assert_eq!(reopened.size_blocks(), 64);
    assert_eq!(reopened.verify().unwrap().mapped_blocks, 48);
}
