// src/core/mod.rs

//! Domain logic: scan data model, protocol scanners, and the guidance
//! classification rules. Nothing in here touches the service surface;
//! everything is callable from plain async tests.

pub mod guidance;
pub mod models;
pub mod scanner;
