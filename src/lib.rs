// src/lib.rs

//! grade-sync: background grade refresh, change notification and
//! course-work archives.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
