#![allow(missing_docs)]

use std::sync::Arc;

use extmap::primitives::io::{FileIo, MemFileIo};
use extmap::storage::extent::MapRequest;
use extmap::types::{Lblk, Pblk};
use extmap::{Config, ExtentTree, Volume};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const SEED: u64 = 0x6578_746d_6170;
const SPAN: u32 = 2048;
const STEPS: usize = 400;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn volume(cluster_ratio: u32) -> Result<Volume> {
    let mut config = Config::default();
    config.volume.block_size = 512;
    config.volume.block_count = 16384;
    config.volume.cluster_ratio = cluster_ratio;
    config.tree.max_zeroout_kb = 0;
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::default());
    Ok(Volume::format(io, &config)?)
}

/// Mirrors the tree block by block.
struct Model {
    blocks: Vec<Option<Pblk>>,
}

impl Model {
    fn new() -> Self {
        Self {
            blocks: vec![None; SPAN as usize],
        }
    }

    fn map(&mut self, tree: &mut ExtentTree, start: Lblk, len: u32) -> Result<()> {
        let end = start + len;
        let mut lblk = start;
        while lblk < end {
            let map = tree.map_range(MapRequest::create(lblk, end - lblk))?;
            assert!(map.len > 0, "no progress at {lblk}");
            for i in 0..map.len {
                let slot = &mut self.blocks[(lblk + i) as usize];
                let physical = map.physical + u64::from(i);
                match slot {
                    Some(existing) => assert_eq!(*existing, physical, "remapped {}", lblk + i),
                    None => *slot = Some(physical),
                }
            }
            lblk += map.len;
        }
        Ok(())
    }

    fn remove(&mut self, tree: &mut ExtentTree, start: Lblk, end: Lblk) -> Result<()> {
        tree.remove_range(start, end)?;
        for slot in &mut self.blocks[start as usize..=end as usize] {
            *slot = None;
        }
        Ok(())
    }

    fn check(&self, tree: &ExtentTree) -> Result<()> {
        for (lblk, expected) in self.blocks.iter().enumerate() {
            let found = tree.lookup(lblk as Lblk)?.map(|(physical, _)| physical);
            assert_eq!(found, *expected, "block {lblk}");
        }
        Ok(())
    }
}

fn run(cluster_ratio: u32) -> Result<()> {
    let volume = volume(cluster_ratio)?;
    let free = volume.allocator().free_clusters();
    let mut tree = volume.create_file()?;
    let mut model = Model::new();
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ u64::from(cluster_ratio));

    for step in 0..STEPS {
        let start = rng.gen_range(0..SPAN - 1);
        if rng.gen_bool(0.6) {
            let len = rng.gen_range(1..=(SPAN - start).min(24));
            model.map(&mut tree, start, len)?;
        } else {
            let len = rng.gen_range(1..=(SPAN - start).min(160));
            model.remove(&mut tree, start, start + len - 1)?;
        }
        tree.verify()?;
        if step % 50 == 49 {
            model.check(&tree)?;
        }
    }
    model.check(&tree)?;

    tree.remove_range(0, SPAN - 1)?;
    assert!(tree.extents()?.is_empty());
    assert_eq!(tree.depth(), 0);
    assert_eq!(volume.allocator().free_clusters(), free);
    Ok(())
}

#[test]
fn random_map_and_remove_keeps_tree_consistent() -> Result<()> {
    run(1)
}

#[test]
fn random_map_and_remove_with_clusters() -> Result<()> {
    run(4)
}
