pub mod collection;
pub mod config;
pub mod container;
pub mod instance;
pub mod mount;
pub mod procinfo;
