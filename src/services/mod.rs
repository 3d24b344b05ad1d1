//! Bed-level services built on top of an authenticated session.

pub mod bed;
pub mod cover;
pub mod motion;
pub mod registry;

pub use bed::OctoBed;
pub use registry::SessionRegistry;
