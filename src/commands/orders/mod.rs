pub mod cancel_order_command;
pub mod deliver_order_command;
pub mod ship_order_command;

pub use cancel_order_command::CancelOrderCommand;
pub use deliver_order_command::DeliverOrderCommand;
pub use ship_order_command::ShipOrderCommand;
