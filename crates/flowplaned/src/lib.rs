//! flowplaned — assembly of the flowplane control plane.
//!
//! The binary in `main.rs` parses the command line and configuration, then
//! hands off to [`ControlPlane`], which owns every subsystem and exposes the
//! REST router and the background loops.

pub mod control_plane;

pub use control_plane::ControlPlane;
