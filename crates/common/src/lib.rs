// gitmirror-common: shared types and wire formats for the gitmirror workspace

pub mod protocol;
pub mod types;
