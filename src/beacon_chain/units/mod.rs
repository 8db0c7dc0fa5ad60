mod epoch;
mod slot;

pub use epoch::Epoch;
pub use slot::slot_from_string;
pub use slot::Slot;
