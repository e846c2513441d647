use std::{mem, sync::Arc};

use aya::maps::{perf::AsyncPerfEventArrayBuffer, MapData};
use bytes::BytesMut;
use netconn_common::Batch;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{closed::Message, telemetry::Telemetry};

const READ_BUFFERS: usize = 10;

// payload offsets are not aligned for Batch
pub fn read_batch(payload: &[u8]) -> Batch {
    assert!(
        payload.len() >= mem::size_of::<Batch>(),
        "batch size is out of sync: perf payload of {} bytes, batch is {}",
        payload.len(),
        mem::size_of::<Batch>()
    );
    let ptr = payload.as_ptr() as *const Batch;
    unsafe { ptr.read_unaligned() }
}

pub fn event_loop(
    cpu: u32,
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    tx: UnboundedSender<Message>,
    telemetry: Arc<Telemetry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffers = (0..READ_BUFFERS)
            .map(|_| BytesMut::with_capacity(mem::size_of::<Batch>()))
            .collect::<Vec<_>>();

        loop {
            let events = match buf.read_events(&mut buffers).await {
                Ok(events) => events,
                Err(e) => {
                    error!("failed to read closed connections for cpu {}: {}", cpu, e);
                    return;
                }
            };

            telemetry.perf_events(events.read as u64, events.lost as u64);
            if events.lost > 0 {
                warn!("lost {} closed connection batches on cpu {}", events.lost, cpu);
            }

            for payload in buffers.iter_mut().take(events.read) {
                let batch = read_batch(payload);
                if tx.send(Message::Batch { cpu, batch }).is_err() {
                    debug!("close consumer gone, stopping event loop for cpu {}", cpu);
                    return;
                }
            }
        }
    })
}
