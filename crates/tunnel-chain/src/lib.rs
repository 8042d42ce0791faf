pub mod chain;
pub mod server;
pub mod session;
pub mod socks;
pub mod ssh;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::HopChain;
pub use server::{TunnelChain, TunnelHandle, TunnelOptions, TunnelServer, DEFAULT_IDLE_CLOSE_DELAY};
pub use session::{ConnectTarget, ExecStatus, FileChannel, SecureSession, SessionFactory};
pub use ssh::{SshOptions, SshSessionFactory};
