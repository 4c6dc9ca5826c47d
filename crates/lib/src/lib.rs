//! strata-lib: compiling filesystem image layers
//!
//! A layer is built from a set of feature items into a subvolume:
//! - `item`: what gets installed, and which image paths each item provides
//!   and requires
//! - `graph`: dependency validation and batch ordering
//! - `compile`: phases, the concurrent batch scheduler, and the whole
//!   compile invocation
//! - `isolate`: re-entering the build appliance
//! - `subvol`: storage backends, sealing, and build locking

pub mod compile;
pub mod consts;
pub mod descriptor;
pub mod graph;
pub mod isolate;
pub mod item;
pub mod options;
pub mod subvol;
