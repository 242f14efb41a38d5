// Control protocol
// command: line decoding into the Command enum
// mailbox: newest-wins order hand-off to the motion executor

pub mod command;
pub mod mailbox;
