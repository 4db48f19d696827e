use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};

use crate::comm::batched::{batched_channel, run_batched_writer};
use crate::comm::{connect_to, DaskConnection};
use crate::common::data::Value;
use crate::protocol::protocol::{
    dask_framed, deserialize_packet, message_from_value, packet_to_messages,
    serialize_single_packet,
};
use crate::protocol::workermsg::{GetDataMsg, SchedulerRpcMsg, WorkerMessage};
use crate::worker::gather::ensure_communicating;
use crate::worker::loader::CodeLoader;
use crate::worker::reactor::{add_task, delete_data, ensure_computing};
use crate::worker::state::{WorkerConfig, WorkerStateRef};
use crate::worker::transitions::release_key;

const PORT_RETRY_LIMIT: u32 = 32;

/// Starts the worker: binds the public listener, registers with the
/// scheduler and serves connections until a `close` arrives or the
/// scheduler goes away. Must run inside a `tokio::task::LocalSet`.
pub async fn run_worker(config: WorkerConfig, loader: Rc<dyn CodeLoader>) -> crate::Result<()> {
    let (listener, port) = bind_listener(&config).await?;
    let address = format!("tcp://{}:{}", advertised_ip(&config.listen_address), port);
    log::info!("worker listening at {}", address);

    let state_ref = WorkerStateRef::new(config, address, loader);
    register_worker(&state_ref).await?;
    let shutdown = state_ref.get().shutdown.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                log::debug!("connection accepted from {}", peer);
                socket.set_nodelay(true)?;
                let state_ref = state_ref.clone();
                tokio::task::spawn_local(async move {
                    if let Err(error) = handle_connection(state_ref, socket).await {
                        log::warn!("connection failed: {}", error);
                    }
                });
            }
            _ = shutdown.notified() => {
                log::info!("worker shutting down");
                return Ok(());
            }
        }
    }
}

/// Binds a listener on a random port from the configured range, retrying
/// on busy ports a bounded number of times.
async fn bind_listener(config: &WorkerConfig) -> crate::Result<(TcpListener, u16)> {
    // A loopback listen address would make the advertised (rewritten)
    // address unreachable, so loopback binds the wildcard interface.
    let bind_address = match config.listen_address.as_str() {
        "127.0.0.1" | "0.0.0.0" => "0.0.0.0",
        other => other,
    };
    let (low, high) = config.listen_port_range;
    for _ in 0..PORT_RETRY_LIMIT {
        let port = rand::thread_rng().gen_range(low..=high);
        match TcpListener::bind((bind_address, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
                log::debug!("port {} is busy, retrying", port);
            }
            Err(error) => return Err(error.into()),
        }
    }
    Err("no free port found in the configured range".into())
}

/// The advertised address must be meaningful to remote peers, so the
/// loopback and wildcard literals are rewritten to the host's primary IP.
fn advertised_ip(listen_address: &str) -> String {
    if listen_address != "127.0.0.1" && listen_address != "0.0.0.0" {
        return listen_address.to_owned();
    }
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        // Never actually sends; only resolves the default route's source IP.
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });
    match probe {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_owned(),
    }
}

async fn register_worker(state_ref: &WorkerStateRef) -> crate::Result<()> {
    let (scheduler_address, message) = {
        let state = state_ref.get();
        (
            state.config.scheduler_address.clone(),
            state.registration_message(),
        )
    };
    let mut connection = connect_to(&scheduler_address).await?;
    connection
        .send(serialize_single_packet(&SchedulerRpcMsg::Register(message))?)
        .await?;
    let packet = connection
        .next()
        .await
        .ok_or_else(|| crate::DsError::from("scheduler closed during registration"))??;
    let reply: String = deserialize_packet(&packet)?;
    if reply != "OK" {
        return Err(format!("scheduler refused registration: {}", reply).into());
    }
    log::info!("registered with scheduler at {}", scheduler_address);
    Ok(())
}

/// Serves one accepted connection: administrative request/reply ops until
/// (and unless) the scheduler converts it into the compute stream.
async fn handle_connection(
    state_ref: WorkerStateRef,
    socket: TcpStream,
) -> crate::Result<()> {
    let mut framed = dask_framed(socket);
    while let Some(packet) = framed.next().await {
        let packet = packet?;
        for value in packet_to_messages(&packet)? {
            let message: WorkerMessage = match message_from_value(value) {
                Ok(message) => message,
                Err(error) => {
                    log::warn!("unknown or malformed operation: {}", error);
                    continue;
                }
            };
            match message {
                WorkerMessage::ComputeStream => {
                    return run_compute_stream(state_ref, framed).await;
                }
                WorkerMessage::GetData(msg) => {
                    let response = build_get_data_response(&state_ref, &msg);
                    framed.send(response?).await?;
                }
                WorkerMessage::Keys => {
                    let response = {
                        let state = state_ref.get();
                        let keys: Vec<_> = state.data.keys().cloned().collect();
                        serialize_single_packet(&keys)?
                    };
                    framed.send(response).await?;
                }
                WorkerMessage::DeleteData(msg) | WorkerMessage::DeleteDataRpc(msg) => {
                    {
                        let mut state = state_ref.get_mut();
                        delete_data(&mut state, msg.keys, msg.report);
                    }
                    ensure_computing(&state_ref);
                    ensure_communicating(&state_ref);
                    framed.send(serialize_single_packet(&"OK")?).await?;
                }
                WorkerMessage::Gather | WorkerMessage::Terminate => {
                    log::warn!("operation not implemented");
                }
                WorkerMessage::Close => {
                    state_ref.get().shutdown.notify_one();
                    return Ok(());
                }
                WorkerMessage::ComputeTask(_) | WorkerMessage::ReleaseTask(_) => {
                    log::warn!("task operation received outside the compute stream");
                }
            }
        }
    }
    Ok(())
}

fn build_get_data_response(
    state_ref: &WorkerStateRef,
    msg: &GetDataMsg,
) -> crate::Result<crate::protocol::protocol::DaskPacket> {
    let state = state_ref.get();
    if let Some(who) = &msg.who {
        log::debug!("serving {} key(s) to {}", msg.keys.len(), who);
    }
    let mut response: Vec<(Value, Value)> = Vec::with_capacity(msg.keys.len());
    for key in &msg.keys {
        if let Some(value) = state.data.get(key) {
            response.push((Value::from(key.as_str()), value.clone()));
        }
    }
    serialize_single_packet(&Value::Map(response))
}

/// After `compute-stream`, the connection belongs to the scheduler: task
/// commands flow in, state reports flow out through the batched writer.
/// Loss of this stream is fatal for the worker.
async fn run_compute_stream(
    state_ref: WorkerStateRef,
    framed: DaskConnection,
) -> crate::Result<()> {
    log::info!("compute stream opened");
    let rx = {
        let mut state = state_ref.get_mut();
        let (tx, rx) = batched_channel();
        state.sender = Some(tx);
        state.is_computing = true;
        rx
    };
    let (sink, mut stream) = framed.split();
    tokio::task::spawn_local(async move {
        if let Err(error) = run_batched_writer(sink, rx).await {
            log::warn!("batched stream writer failed: {}", error);
        }
    });

    while let Some(packet) = stream.next().await {
        let packet = match packet {
            Ok(packet) => packet,
            Err(error) => {
                log::error!("scheduler stream failed: {}", error);
                break;
            }
        };
        let messages = match packet_to_messages(&packet) {
            Ok(messages) => messages,
            Err(error) => {
                log::error!("scheduler stream sent a malformed packet: {}", error);
                break;
            }
        };
        for value in messages {
            let message: WorkerMessage = match message_from_value(value) {
                Ok(message) => message,
                Err(error) => {
                    log::warn!("unknown or malformed operation: {}", error);
                    continue;
                }
            };
            {
                let mut state = state_ref.get_mut();
                if !state.is_computing {
                    log::warn!("compute stream op after shutdown of computing");
                    continue;
                }
                match message {
                    WorkerMessage::ComputeTask(msg) => add_task(&mut state, msg),
                    WorkerMessage::ReleaseTask(msg) => release_key(
                        &mut state,
                        &msg.key,
                        msg.cause.as_deref(),
                        msg.reason.as_deref(),
                    ),
                    WorkerMessage::DeleteData(msg) | WorkerMessage::DeleteDataRpc(msg) => {
                        delete_data(&mut state, msg.keys, msg.report)
                    }
                    WorkerMessage::Close => {
                        state.shutdown.notify_one();
                        return Ok(());
                    }
                    other => {
                        log::warn!("unexpected operation on compute stream: {:?}", other);
                        continue;
                    }
                }
                state.priority_counter += 1;
            }
            ensure_computing(&state_ref);
            ensure_communicating(&state_ref);
        }
    }

    log::error!("scheduler stream closed unexpectedly");
    state_ref.get().shutdown.notify_one();
    Ok(())
}
