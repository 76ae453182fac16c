mod definition;

pub use definition::{
    BlockMap, ExtentPath, ExtentTree, ExtentTreeOptions, FiemapExtent, FiemapFlags, MapFlags,
    MapMode, MapRequest, PathFrame, TreeEnv, VerifyReport,
};
