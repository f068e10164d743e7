use super::{send_packet, Pacer, PacerPacket};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument, Span};

/// Sends packets as soon as possible, in enqueue order, from one worker.
pub struct NoQueue {
    packets: Arc<Mutex<VecDeque<PacerPacket>>>,
    wake: mpsc::Sender<()>,
    stop: CancellationToken,
}

impl NoQueue {
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(span: Span) -> Self {
        let packets = Arc::new(Mutex::new(VecDeque::with_capacity(16)));
        let (wake, wake_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        tokio::spawn(
            send_worker(Arc::clone(&packets), wake_rx, stop.clone()).instrument(span),
        );

        Self {
            packets,
            wake,
            stop,
        }
    }
}

impl Pacer for NoQueue {
    fn enqueue(&self, packet: PacerPacket) {
        if self.stop.is_cancelled() {
            return;
        }

        let notify = {
            let mut packets = self.packets.lock();
            packets.push_back(packet);
            packets.len() == 1
        };

        if notify {
            // a pending wake-up already covers this packet
            let _ = self.wake.try_send(());
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for NoQueue {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn send_worker(
    packets: Arc<Mutex<VecDeque<PacerPacket>>>,
    mut wake: mpsc::Receiver<()>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            woke = wake.recv() => {
                if woke.is_none() {
                    break;
                }
                loop {
                    let Some(packet) = packets.lock().pop_front() else {
                        break;
                    };
                    send_packet(packet).await;
                }
            }
        }
    }

    let dropped = packets.lock().len();
    debug!(dropped, "pacer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pacer::{PacketSentObserver, RtpWriter};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    struct ChannelWriter(mpsc::UnboundedSender<Packet>);

    #[async_trait]
    impl RtpWriter for ChannelWriter {
        async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
            let _ = self.0.send(packet.clone());
            Ok(packet.payload.len())
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        sent: AtomicUsize,
        padding: AtomicUsize,
    }

    impl PacketSentObserver for CountingObserver {
        fn on_packet_sent(&self, _header: &Header, _size: usize, is_padding: bool, result: &Result<usize>) {
            if result.is_ok() {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if is_padding {
                    self.padding.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn pacer_packet(
        sn: u16,
        writer: &Arc<ChannelWriter>,
        observer: &Arc<CountingObserver>,
        is_padding: bool,
    ) -> PacerPacket {
        PacerPacket {
            packet: Packet {
                header: Header {
                    version: 2,
                    sequence_number: sn,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[1, 2, 3]),
            },
            abs_send_time_ext_id: 3,
            is_padding,
            writer: Arc::clone(writer) as Arc<dyn RtpWriter>,
            observer: Some(Arc::clone(observer) as Arc<dyn PacketSentObserver>),
        }
    }

    #[tokio::test]
    async fn test_sends_in_order_with_abs_send_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = Arc::new(ChannelWriter(tx));
        let observer = Arc::new(CountingObserver::default());
        let pacer = NoQueue::new(Span::none());

        for sn in 0..10 {
            pacer.enqueue(pacer_packet(sn, &writer, &observer, sn % 5 == 0));
        }

        for sn in 0..10 {
            let packet = rx.recv().await.unwrap();
            assert_eq!(packet.header.sequence_number, sn);
            assert_eq!(packet.header.get_extension(3).map(|ext| ext.len()), Some(3));
        }
        tokio::task::yield_now().await;
        assert_eq!(observer.sent.load(Ordering::Relaxed), 10);
        assert_eq!(observer.padding.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_drops_later_packets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = Arc::new(ChannelWriter(tx));
        let observer = Arc::new(CountingObserver::default());
        let pacer = NoQueue::new(Span::none());

        pacer.enqueue(pacer_packet(1, &writer, &observer, false));
        assert_eq!(rx.recv().await.unwrap().header.sequence_number, 1);

        pacer.stop();
        pacer.stop();
        pacer.enqueue(pacer_packet(2, &writer, &observer, false));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
