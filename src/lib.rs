// Barrett WAM runtime: CAN transport, puck bus, joint-space arm and servo loop

pub mod bus;
pub mod can;
pub mod config;
pub mod messages;
pub mod runtime;
pub mod wambot;
