//! EraseFE — mark a region once, erase it from a whole batch of images.
//!
//! The core flow: strokes are captured in display coordinates, normalized to
//! resolution-independent relative space ([`coords`]), snapshotted as an
//! immutable [`strokes::StrokeTemplate`], rasterized into a binary
//! [`mask::Mask`] at each image's native size, and handed with the image to a
//! shared inference session ([`session`]) that paints the marked region out.
//! [`batch`] drives that pipeline serially over many files; [`scheduler`]
//! keeps a host UI's redraws coalesced while it runs.

#[macro_use]
pub mod logger;

pub mod batch;
pub mod cli;
pub mod coords;
pub mod io;
pub mod mask;
pub mod ops;
pub mod scheduler;
pub mod session;
pub mod staging;
pub mod strokes;
