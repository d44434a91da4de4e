mod io;
mod unix_creds;

pub use self::io::Socket;
pub use self::unix_creds::{read_peer_credentials, PeerCredentials};
