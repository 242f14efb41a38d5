// Network layer
// listener: re-bindable socket2 listeners shared with the health monitor
// control: command routing and per-client handler threads
// ownership: single-writer arbitration between control clients
// clients: registry of connected control clients
// video: length-prefixed JPEG streaming to one viewer

pub mod clients;
pub mod control;
pub mod listener;
pub mod ownership;
pub mod video;
