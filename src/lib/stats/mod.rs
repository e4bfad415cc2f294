pub mod accumulator;
pub mod average;
pub mod bitrate;
pub mod clock;
pub mod cpu;
pub mod gpu;
pub mod report;
