pub mod attribution;
pub mod baton;
pub mod config;
pub mod date;
pub mod error;
pub mod event;
pub mod exporter;
pub mod importer;
pub mod log;
pub mod mailbox;
pub mod orderedset;
pub mod pathmap;
pub mod reorg;
pub mod repository;
pub mod selection;
pub mod surgery;
pub mod svndump;
pub mod svnlift;
pub mod util;
pub mod vcs;
