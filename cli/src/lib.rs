//! Front-end for the capstan host: the `serve` loop (tool endpoint plus
//! attach socket) and the attach client.

pub mod attach_cmd;
pub mod processor;
pub mod serve;
