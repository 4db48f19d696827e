use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::common::{Map, WrappedRcRefCell};
use crate::protocol::codec::DaskCodec;
use crate::protocol::key::{DaskKeyRef, WorkerAddress};

pub type DaskConnection = Framed<TcpStream, DaskCodec>;

/// Pool of idle framed connections, keyed by remote address. Connections
/// are returned to the pool only after a complete request/reply exchange,
/// so a pooled stream never carries a half-read packet.
#[derive(Default)]
pub struct ConnectionCache {
    connections: Map<WorkerAddress, Vec<DaskConnection>>,
}

pub type ConnectionCacheRef = WrappedRcRefCell<ConnectionCache>;

impl ConnectionCacheRef {
    pub async fn get_connection(&self, address: &DaskKeyRef) -> crate::Result<DaskConnection> {
        let existing_connection = {
            let mut cache = self.get_mut();
            cache
                .connections
                .get_mut(address)
                .and_then(|pool| pool.pop())
        };
        match existing_connection {
            Some(connection) => Ok(connection),
            None => connect_to(address).await,
        }
    }

    pub fn return_connection(&self, address: &DaskKeyRef, connection: DaskConnection) {
        let mut cache = self.get_mut();
        cache
            .connections
            .entry(address.to_owned())
            .or_default()
            .push(connection);
    }
}

pub async fn connect_to(address: &DaskKeyRef) -> crate::Result<DaskConnection> {
    let address = address.trim_start_matches("tcp://");
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, DaskCodec::default()))
}
