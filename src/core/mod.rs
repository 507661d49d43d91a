pub mod cluster;
pub mod detector;
pub mod embedder;
pub mod face;
pub mod filter;
pub mod hash;
pub mod registry;
pub mod ssim;
