pub mod order_number;
pub mod reservation;
pub mod schemas;

pub use order_number::*;
pub use reservation::*;
pub use schemas::*;
