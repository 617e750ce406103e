//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康状态的批量写入机制。

pub mod batch_writer;
pub mod common;
