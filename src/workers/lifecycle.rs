//! Lifecycle manager (spec §4.11): the coordinator thread that admits a
//! connection, spawns its four workers, and runs the teardown sequence once
//! any of them signal the client is done.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::protocol::framing;
use crate::registry::ClientRecord;
use crate::server::ServerContext;
use crate::workers::{audio_render, receive, send, video_render};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Admit `stream` as a new client and own its four workers for the rest of
/// its life, on a dedicated manager thread so [`crate::server::run`]'s
/// acceptor loop never blocks on a single connection.
pub fn spawn(ctx: Arc<ServerContext>, stream: TcpStream) {
    thread::spawn(move || run(ctx, stream));
}

fn run(ctx: Arc<ServerContext>, stream: TcpStream) {
    if let Err(e) = framing::configure_stream(&stream) {
        warn!(error = %e, "failed to configure client socket");
        return;
    }

    let capacity = ctx.admission_capacity();
    let record = match ctx.registry.insert_with_capacity(stream, capacity) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "rejecting connection, registry at capacity");
            return;
        }
    };

    info!(client_id = record.id, "client admitted");

    let (receive_stream, send_stream) = {
        let guard = record.socket.lock();
        let Some(canonical) = guard.as_ref() else {
            warn!(client_id = record.id, "client socket missing at spawn time");
            drop(guard);
            ctx.registry.remove(record.id);
            return;
        };
        (canonical.try_clone(), canonical.try_clone())
    };
    let (Ok(receive_stream), Ok(send_stream)) = (receive_stream, send_stream) else {
        warn!(client_id = record.id, "failed to clone client socket");
        ctx.registry.remove(record.id);
        return;
    };

    let send_handle: JoinHandle<()> = {
        let client = Arc::clone(&record);
        thread::spawn(move || send::run(&client, send_stream))
    };
    let receive_handle: JoinHandle<()> = {
        let ctx = Arc::clone(&ctx);
        let client = Arc::clone(&record);
        thread::spawn(move || receive::run(&ctx, &client, receive_stream))
    };
    let video_handle: JoinHandle<()> = {
        let ctx = Arc::clone(&ctx);
        let client = Arc::clone(&record);
        thread::spawn(move || video_render::run(&ctx, &client))
    };
    let audio_handle: JoinHandle<()> = {
        let ctx = Arc::clone(&ctx);
        let client = Arc::clone(&record);
        thread::spawn(move || audio_render::run(&ctx, &client))
    };

    // Block until this client goes inactive (the receive worker hit EOF or
    // a fatal error) or the whole process is shutting down.
    while record.active.load(Ordering::Acquire) && !ctx.registry.should_exit() {
        thread::sleep(LIVENESS_POLL);
    }

    teardown(&ctx, &record, send_handle, receive_handle, video_handle, audio_handle);
}

/// Spec §4.11 teardown order: clear liveness flags, shut down the send
/// queue and audio ring so blocked workers wake, close the socket in both
/// directions, then join send -> receive -> video_render -> audio_render,
/// remove the client from the registry, and wipe its crypto context last.
fn teardown(
    ctx: &Arc<ServerContext>,
    record: &Arc<ClientRecord>,
    send_handle: JoinHandle<()>,
    receive_handle: JoinHandle<()>,
    video_handle: JoinHandle<()>,
    audio_handle: JoinHandle<()>,
) {
    record.stop_all();
    record.send_queue.shutdown();
    record.incoming_audio.shutdown();

    if let Some(socket) = record.socket.lock().as_ref() {
        let _ = socket.shutdown(Shutdown::Both);
    }

    let _ = send_handle.join();
    let _ = receive_handle.join();
    let _ = video_handle.join();
    let _ = audio_handle.join();

    ctx.registry.remove(record.id);
    *record.crypto.lock() = None;

    info!(client_id = record.id, "client torn down");
}
