pub mod fs;
pub mod system;
pub mod twitter;
pub mod web;
