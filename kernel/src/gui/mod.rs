//! GUI
//!
//! The window manager and compositor.

pub mod window;
