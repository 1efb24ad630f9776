mod busy_poll;
mod gate;

pub use busy_poll::BusyPoll;
pub use gate::StartGate;
