pub mod connection;
pub mod protocol;
pub mod socket;

pub use connection::{StratumConnection, StratumOwner};
pub use protocol::{StatusHash, StratumTask};
pub use socket::{Connector, SocketEvent, TcpConnector};
