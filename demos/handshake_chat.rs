use clap::Parser;
use clap_derive::Parser;
use sharing_core::buffers::message_pool::MessagePool;
use sharing_core::config::NetConfig;
use sharing_core::connection::Connection;
use sharing_core::handshake::{HandshakeLogic, HandshakeResult, NetworkHandshake};
use sharing_core::manager::{ConnectionManager, IncomingConnectionListener};
use sharing_core::message_types::{MessageChannel, MessageId, MessagePriority, MessageReliability};
use sharing_core::network_connection::{NetworkConnection, NetworkConnectionListener};
use sharing_core::network_message::{NetworkInMessage, NetworkOutMessage};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};

/// A minimal chat over the connection core: the accepting side echoes every line it receives,
///  the connecting side sends a few lines and prints the echoes.
#[derive(Parser)]
struct Args {
    port: u16,

    /// Connect to a node accepting at this address instead of accepting connections
    #[clap(long)]
    connect: Option<String>,

    #[clap(long, default_value_t = 5)]
    num_lines: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const CHAT_TAG: u8 = MessageId::USER_MESSAGE_ID_START;
const PROTOCOL: &[u8] = b"handshake-chat/1";

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .try_init()
        .ok();

    let mut manager = ConnectionManager::new(Arc::new(NetConfig::default()))?;
    let chats: Arc<Mutex<Vec<NetworkConnection>>> = Default::default();

    match &args.connect {
        Some(address) => run_client(&mut manager, chats, address, args.port, args.num_lines),
        None => run_server(&mut manager, chats, args.port),
    }
}

fn run_server(manager: &mut ConnectionManager, chats: Arc<Mutex<Vec<NetworkConnection>>>, port: u16) -> anyhow::Result<()> {
    let incoming = Arc::new(ChatServer {
        pool: manager.message_pool(),
        chats: chats.clone(),
        echo: Arc::new(EchoListener {}),
    });
    let _receipt = manager.accept(port, 16, incoming);
    info!("accepting chat connections on port {}", port);

    loop {
        manager.update();

        chats.lock().unwrap()
            .retain(|chat| chat.socket().is_some());
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn run_client(manager: &mut ConnectionManager, chats: Arc<Mutex<Vec<NetworkConnection>>>, address: &str, port: u16, num_lines: usize) -> anyhow::Result<()> {
    let connection = manager.open(address, port);
    let printer: Arc<dyn NetworkConnectionListener> = Arc::new(PrintListener {});
    start_handshake(connection, manager.message_pool(), chats.clone(), printer);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut num_sent = 0;
    let mut next_send = Instant::now();

    while Instant::now() < deadline {
        manager.update();

        let chat = chats.lock().unwrap().first().cloned();
        if let Some(chat) = chat {
            if !chat.is_connected() {
                warn!("connection was closed");
                return Ok(());
            }
            if num_sent == num_lines {
                // give the last echo some time to arrive
                if Instant::now() > next_send {
                    chat.disconnect();
                    manager.update();
                    return Ok(());
                }
            }
            else if Instant::now() >= next_send {
                let mut message = chat.create_message(CHAT_TAG);
                message.write_array(format!("line #{}", num_sent).as_bytes());
                chat.send_and_release(message, MessagePriority::Medium, MessageReliability::ReliableOrdered, MessageChannel::USER_MESSAGE_CHANNEL_START);

                num_sent += 1;
                next_send = Instant::now() + Duration::from_millis(500);
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    warn!("giving up after timeout");
    Ok(())
}

fn start_handshake(connection: Connection, pool: Arc<MessagePool>, chats: Arc<Mutex<Vec<NetworkConnection>>>, chat_listener: Arc<dyn NetworkConnectionListener>) {
    let chat_pool = pool.clone();
    NetworkHandshake::start(connection, Arc::new(ChatHandshake {}), pool, Box::new(move |connection, socket_id, result| {
        match (result, connection) {
            (HandshakeResult::Success, Some(connection)) => {
                info!("{:?}: handshake successful - chatting", socket_id);
                let chat = NetworkConnection::new(chat_pool);
                chat.add_listener(CHAT_TAG, chat_listener);
                chat.set_socket(Some(connection));
                chats.lock().unwrap().push(chat);
            }
            (result, _) => {
                warn!("{:?}: handshake failed: {:?}", socket_id, result);
            }
        }
    }));
}

struct ChatHandshake {}
impl HandshakeLogic for ChatHandshake {
    fn create_outgoing_message(&self, message: &mut NetworkOutMessage) {
        message.write_array(PROTOCOL);
    }

    fn validate_incoming_message(&self, message: &mut NetworkInMessage) -> bool {
        message.read_rest().as_ref() == PROTOCOL
    }
}

/// Starts the handshake right away, so that it is registered before the remote side's
///  handshake message is dispatched
struct ChatServer {
    pool: Arc<MessagePool>,
    chats: Arc<Mutex<Vec<NetworkConnection>>>,
    echo: Arc<dyn NetworkConnectionListener>,
}
impl IncomingConnectionListener for ChatServer {
    fn on_incoming_connection(&self, connection: Connection) {
        info!("incoming connection from {:?}", connection.remote_address());
        start_handshake(connection, self.pool.clone(), self.chats.clone(), self.echo.clone());
    }
}

struct EchoListener {}
impl NetworkConnectionListener for EchoListener {
    fn on_disconnected(&self, connection: &NetworkConnection) {
        info!("{:?}: chat partner left", connection);
    }

    fn on_message_received(&self, connection: &NetworkConnection, message: &mut NetworkInMessage) {
        let line = message.read_rest();
        info!("received {:?}", String::from_utf8_lossy(&line));

        let mut echo = connection.create_message(CHAT_TAG);
        echo.write_array(b"echo: ");
        echo.write_array(&line);
        connection.send_and_release(echo, MessagePriority::Medium, MessageReliability::ReliableOrdered, MessageChannel::USER_MESSAGE_CHANNEL_START);
    }
}

struct PrintListener {}
impl NetworkConnectionListener for PrintListener {
    fn on_message_received(&self, _connection: &NetworkConnection, message: &mut NetworkInMessage) {
        info!("{}", String::from_utf8_lossy(&message.read_rest()));
    }
}
