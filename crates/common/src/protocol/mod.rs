// Wire formats: git smart-HTTP pkt-lines and the JSON API payloads.

pub mod api;
pub mod pktline;
