//! Client-side implementation for the Biomine object exchange.
//!
//! A [`Client`] holds one TCP connection to a server. It subscribes, sends
//! objects and reads whatever the server routes to it, answering the
//! server's pings along the way.
//!
//! Outgoing bytes go through an outbox that is drained with single writes,
//! so [`Client::next_object`] can be dropped mid-way (for example by
//! `tokio::select!`) without losing or tearing a frame.

use bmoe_core::{
    EventKind, Frame, FrameDecoder, FrameError, Metadata, Role, Subscriptions, checksum, keys,
    new_object_id,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// MIME type of the text objects sent by [`Client::send_text`].
pub const TEXT_TYPE: &str = "text/plain; charset=UTF-8";

/// Ways talking to a server can fail.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid subscriptions: {0}")]
    Subscriptions(#[from] serde_json::Error),
}

/// Contents of a `routing/subscribe` request.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subscriptions: Subscriptions,
    pub routing_id: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub role: Role,
}

impl SubscribeRequest {
    /// Request for `subscriptions` as a plain client, letting the server
    /// pick the routing-id.
    pub fn new(subscriptions: Subscriptions) -> Self {
        Self {
            subscriptions,
            routing_id: None,
            name: None,
            username: None,
            role: Role::Client,
        }
    }

    /// Ask for a specific routing-id.
    pub fn with_routing_id(mut self, routing_id: impl Into<String>) -> Self {
        self.routing_id = Some(routing_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Subscribe as something other than a plain client.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    fn into_metadata(self) -> Result<Metadata, serde_json::Error> {
        let mut metadata = Metadata::event(EventKind::Subscribe);
        metadata.insert(keys::ID, new_object_id());
        metadata.insert(keys::ROLE, self.role.as_str());
        metadata.insert(keys::SUBSCRIPTIONS, serde_json::to_value(&self.subscriptions)?);
        if let Some(routing_id) = self.routing_id {
            metadata.insert(keys::ROUTING_ID, routing_id);
        }
        if let Some(name) = self.name {
            metadata.insert(keys::NAME, name);
        }
        if let Some(username) = self.username {
            metadata.insert(keys::USERNAME, username);
        }
        Ok(metadata)
    }
}

/// Connection to an object exchange server.
pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    outbox: Vec<u8>,
    routing_id: Option<String>,
}

impl Client {
    /// Open a connection. Nothing is sent until [`Client::subscribe`].
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
            outbox: Vec::new(),
            routing_id: None,
        })
    }

    /// Routing-id the server assigned us, once a subscribe reply arrived.
    pub fn routing_id(&self) -> Option<&str> {
        self.routing_id.as_deref()
    }

    /// Send a `routing/subscribe` request. The reply comes back through
    /// [`Client::next_object`].
    pub async fn subscribe(&mut self, request: SubscribeRequest) -> Result<(), ClientError> {
        let metadata = request.into_metadata()?;
        self.send_object(metadata, None).await
    }

    /// Encode and send one object, after anything still queued.
    pub async fn send_object(
        &mut self,
        mut metadata: Metadata,
        payload: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        let bytes = bmoe_core::encode_frame(&mut metadata, payload)?;
        self.outbox.extend_from_slice(&bytes);
        while !self.outbox.is_empty() {
            self.write_some().await?;
        }
        Ok(())
    }

    /// Write part of the outbox. A cancelled `write` writes nothing, so
    /// cancelling this leaves the outbox intact.
    async fn write_some(&mut self) -> Result<(), ClientError> {
        let n = self.stream.write(&self.outbox).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        self.outbox.drain(..n);
        Ok(())
    }

    /// Send `text` as a `text/plain` object carrying its SHA-1.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        let mut metadata = Metadata::data(TEXT_TYPE);
        metadata.insert(keys::SHA1, checksum(text.as_bytes()));
        self.send_object(metadata, Some(text.as_bytes())).await
    }

    /// Ping the server, or whoever `to` names. Returns the ping's id.
    pub async fn ping(&mut self, to: Option<&str>) -> Result<String, ClientError> {
        let id = new_object_id();
        let mut metadata = Metadata::event(EventKind::Ping);
        metadata.insert(keys::ID, id.clone());
        if let Some(to) = to {
            metadata.insert(keys::TO, to);
        }
        if let Some(routing_id) = &self.routing_id {
            metadata.insert(keys::ROUTING_ID, routing_id.clone());
        }
        self.send_object(metadata, None).await?;
        Ok(id)
    }

    /// Next object the server sent us, or `None` once the connection closed.
    ///
    /// Pings are answered here and not returned. A subscribe reply is
    /// returned after its routing-id has been recorded. Pending pongs are
    /// written before anything else is read.
    ///
    /// Cancel safe: dropping the future loses no frames in either direction.
    pub async fn next_object(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            if !self.outbox.is_empty() {
                self.write_some().await?;
                continue;
            }

            if let Some(frame) = self.decoder.next_frame()? {
                match frame.metadata.kind() {
                    bmoe_core::ObjectKind::Event(EventKind::Ping) => {
                        self.queue_pong(&frame.metadata)?;
                        continue;
                    }
                    bmoe_core::ObjectKind::Event(EventKind::SubscribeReply) => {
                        if let Some(routing_id) = frame.metadata.routing_id() {
                            tracing::debug!(routing_id, "Subscribed");
                            self.routing_id = Some(routing_id.to_string());
                        }
                        return Ok(Some(frame));
                    }
                    _ => return Ok(Some(frame)),
                }
            }

            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(bytes = self.decoder.buffered(), "Connection closed mid-frame");
                }
                return Ok(None);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    fn queue_pong(&mut self, ping: &Metadata) -> Result<(), ClientError> {
        let mut pong = Metadata::event(EventKind::Pong);
        pong.insert(keys::ID, new_object_id());
        if let Some(id) = ping.id() {
            pong.insert(keys::IN_REPLY_TO, id);
        }
        if let Some(from) = ping.routing_id() {
            pong.insert(keys::TO, from);
        }
        if let Some(routing_id) = &self.routing_id {
            pong.insert(keys::ROUTING_ID, routing_id.clone());
        }
        tracing::debug!(in_reply_to = ping.id(), "Pong");
        let bytes = bmoe_core::encode_frame(&mut pong, None)?;
        self.outbox.extend_from_slice(&bytes);
        Ok(())
    }

    /// Flush pending pongs and shut the connection down.
    pub async fn close(mut self) -> Result<(), ClientError> {
        while !self.outbox.is_empty() {
            self.write_some().await?;
        }
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmoe_core::{Addressing, ObjectKind, encode_frame};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn pair() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Client::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Frame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return frame;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            decoder.push(&buf[..n]);
        }
    }

    #[test]
    fn subscribe_request_metadata() {
        let metadata = SubscribeRequest::new(Subscriptions::all())
            .with_routing_id("me")
            .with_name("desk")
            .with_role(Role::Service)
            .into_metadata()
            .unwrap();

        assert_eq!(metadata.kind(), ObjectKind::Event(EventKind::Subscribe));
        assert!(metadata.id().is_some());
        assert_eq!(metadata.routing_id(), Some("me"));
        assert_eq!(metadata.str(keys::NAME), Some("desk"));
        assert_eq!(metadata.str(keys::ROLE), Some("service"));
        assert_eq!(metadata.get(keys::SUBSCRIPTIONS), Some(&serde_json::json!(["*"])));
        assert!(!metadata.contains_key(keys::USERNAME));
    }

    #[tokio::test]
    async fn text_carries_checksum() {
        let (mut client, mut server) = pair().await;
        client.send_text("hello").await.unwrap();

        let frame = read_frame(&mut server, &mut FrameDecoder::new()).await;
        assert_eq!(frame.metadata.str(keys::TYPE), Some(TEXT_TYPE));
        assert_eq!(frame.metadata.sha1(), Some(checksum(b"hello").as_str()));
        assert_eq!(frame.metadata.declared_size(), Some(5));
        assert_eq!(frame.payload.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn records_routing_id_and_answers_pings() {
        let (mut client, mut server) = pair().await;

        let mut reply = Metadata::event(EventKind::SubscribeReply);
        reply.insert(keys::ROUTING_ID, "assigned");
        let mut ping = Metadata::event(EventKind::Ping);
        ping.insert(keys::ID, "p1");
        ping.insert(keys::TO, "assigned");
        let mut data = Metadata::data("text/plain");
        let mut bytes = encode_frame(&mut reply, None).unwrap();
        bytes.extend(encode_frame(&mut ping, None).unwrap());
        bytes.extend(encode_frame(&mut data, Some(b"after")).unwrap());
        server.write_all(&bytes).await.unwrap();

        let first = client.next_object().await.unwrap().unwrap();
        assert_eq!(first.metadata.kind(), ObjectKind::Event(EventKind::SubscribeReply));
        assert_eq!(client.routing_id(), Some("assigned"));

        let second = client.next_object().await.unwrap().unwrap();
        assert_eq!(second.payload.as_deref(), Some(&b"after"[..]));

        let pong = read_frame(&mut server, &mut FrameDecoder::new()).await;
        assert_eq!(pong.metadata.kind(), ObjectKind::Event(EventKind::Pong));
        assert_eq!(pong.metadata.str(keys::IN_REPLY_TO), Some("p1"));
        assert_eq!(pong.metadata.routing_id(), Some("assigned"));
        // No routing-id on the ping, so the pong is for the adjacent server.
        assert_eq!(pong.metadata.addressing("srv"), Addressing::Local);
    }

    #[tokio::test]
    async fn end_of_stream_is_none() {
        let (mut client, server) = pair().await;
        drop(server);
        assert!(client.next_object().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_reads_keep_pongs_whole() {
        const PINGS: usize = 5000;
        let (mut client, server) = pair().await;
        let (mut server_rx, mut server_tx) = server.into_split();

        let feeder = tokio::spawn(async move {
            let mut bytes = Vec::new();
            for i in 0..PINGS {
                let mut ping = Metadata::event(EventKind::Ping);
                ping.insert(keys::ID, format!("p{i}"));
                bytes.extend(encode_frame(&mut ping, None).unwrap());
            }
            let mut data = Metadata::data("text/plain");
            bytes.extend(encode_frame(&mut data, Some(b"done")).unwrap());
            server_tx.write_all(&bytes).await.unwrap();
            server_tx
        });
        let collector = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            let mut replies = Vec::new();
            while replies.len() < PINGS {
                if let Some(frame) = decoder.next_frame().unwrap() {
                    replies.push(frame.metadata.str(keys::IN_REPLY_TO).map(str::to_string));
                    continue;
                }
                let n = server_rx.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the connection");
                decoder.push(&buf[..n]);
            }
            replies
        });

        // Give up on every call as soon as it would wait, like a losing
        // `select!` branch does.
        let data = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Ok(object) = tokio::time::timeout(Duration::ZERO, client.next_object()).await
                {
                    break object.unwrap().unwrap();
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("data object never arrived");
        assert_eq!(data.payload.as_deref(), Some(&b"done"[..]));

        let replies = tokio::time::timeout(Duration::from_secs(30), collector)
            .await
            .unwrap()
            .unwrap();
        let expected: Vec<_> = (0..PINGS).map(|i| Some(format!("p{i}"))).collect();
        assert_eq!(replies, expected);
        drop(feeder.await.unwrap());
    }
}
