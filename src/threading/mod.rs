//! Threading module for asynchronous encoding and decoding
//!
//! Each [`CodecWorker`] owns one named thread that drives one
//! [`CodecContext`] through the send/receive loop. Jobs arrive over a
//! bounded queue and results are delivered as [`CodecEvent`]s, in
//! submission order, to a handler attached with [`CodecWorker::on_event`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::avcodec::{CodecContext, Packet};
use crate::avutil::Frame;
use crate::config;
use crate::error::{Error, Result, AVERROR_EAGAIN};

/// Work item for a codec worker
#[derive(Debug)]
pub enum CodecJob {
    /// Frame to encode, `None` to drain the encoder
    Frame(Option<Arc<Frame>>),
    /// Packet to decode, `None` to drain the decoder
    Packet(Option<Arc<Packet>>),
    /// Stop after the jobs queued before this one
    Shutdown,
}

/// Output of a codec worker
#[derive(Debug)]
pub enum CodecEvent {
    /// Encoded packet
    Packet(Arc<Packet>),
    /// Decoded frame
    Frame(Arc<Frame>),
    /// Every output of a drain request has been delivered
    Drained,
    /// A native call failed while processing a job
    Error(Error),
}

type Handler = Box<dyn FnMut(CodecEvent) + Send>;

#[derive(Default)]
struct DispatchState {
    handler: Option<Handler>,
    pending: VecDeque<CodecEvent>,
}

/// Hands events to the handler, queueing them while none is attached.
///
/// The handler runs with the dispatch lock held and must not call
/// [`CodecWorker::on_event`] itself.
#[derive(Default)]
struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    fn dispatch(&self, event: CodecEvent) {
        let mut state = self.state.lock();
        match state.handler.as_mut() {
            Some(handler) => handler(event),
            None => state.pending.push_back(event),
        }
    }

    fn attach(&self, mut handler: Handler) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            log::debug!("Flushing {} queued codec events", pending.len());
        }
        for event in pending {
            handler(event);
        }
        state.handler = Some(handler);
    }
}

/// Background driver for one codec context
pub struct CodecWorker {
    /// Job sender
    jobs: Sender<CodecJob>,

    /// Event fan-out (shared with the worker thread)
    events: Arc<Dispatcher>,

    /// Worker thread, taken on shutdown
    worker: Mutex<Option<JoinHandle<()>>>,

    context: Arc<CodecContext>,
}

impl CodecWorker {
    /// Start a worker thread for `context`. The queue depth comes from the
    /// active [`config::BridgeConfig`].
    pub fn spawn(context: Arc<CodecContext>) -> Result<CodecWorker> {
        let (jobs, job_rx) = bounded(config::current().codec_queue_depth.max(1));
        let events = Arc::new(Dispatcher::default());
        let name = context
            .codec()
            .name()
            .unwrap_or_else(|_| "unknown".to_string());

        let handle = {
            let context = context.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(format!("codec-worker-{}", name))
                .spawn(move || Self::worker_loop(context, job_rx, events))?
        };

        log::debug!("Codec worker for {} started", name);
        Ok(CodecWorker {
            jobs,
            events,
            worker: Mutex::new(Some(handle)),
            context,
        })
    }

    pub fn context(&self) -> &Arc<CodecContext> {
        &self.context
    }

    /// Queue a frame for encoding, or `None` to drain. Blocks while the
    /// queue is full.
    pub fn submit_frame(&self, frame: Option<Arc<Frame>>) -> Result<()> {
        self.jobs.send(CodecJob::Frame(frame))?;
        Ok(())
    }

    /// Queue a packet for decoding, or `None` to drain
    pub fn submit_packet(&self, packet: Option<Arc<Packet>>) -> Result<()> {
        self.jobs.send(CodecJob::Packet(packet))?;
        Ok(())
    }

    /// Attach the event handler. Events produced earlier are replayed to it
    /// first, in order. A later call replaces the handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: FnMut(CodecEvent) + Send + 'static,
    {
        self.events.attach(Box::new(handler));
    }

    /// Finish the queued jobs and stop the worker thread
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.jobs.send(CodecJob::Shutdown);
        if handle.join().is_err() {
            log::error!("Codec worker panicked");
        }
    }

    /// Worker loop: one job at a time, so events keep submission order
    fn worker_loop(context: Arc<CodecContext>, jobs: Receiver<CodecJob>, events: Arc<Dispatcher>) {
        log::debug!("Codec worker loop started");

        while let Ok(job) = jobs.recv() {
            let result = match job {
                CodecJob::Frame(frame) => Self::encode(&context, frame.as_deref(), &events),
                CodecJob::Packet(packet) => Self::decode(&context, packet.as_deref(), &events),
                CodecJob::Shutdown => {
                    log::debug!("Codec worker shutdown received");
                    break;
                }
            };

            if let Err(e) = result {
                log::error!("Codec worker job failed: {}", e);
                events.dispatch(CodecEvent::Error(e));
            }
        }

        log::debug!("Codec worker loop stopped");
    }

    fn encode(context: &CodecContext, frame: Option<&Frame>, events: &Dispatcher) -> Result<()> {
        pump(
            || context.send_frame(frame),
            || {
                let packet = Packet::new()?;
                Ok(context.receive_packet(&packet)?.then_some(packet))
            },
            |packet| events.dispatch(CodecEvent::Packet(packet)),
            "avcodec_send_frame",
        )?;
        if frame.is_none() {
            events.dispatch(CodecEvent::Drained);
        }
        Ok(())
    }

    fn decode(context: &CodecContext, packet: Option<&Packet>, events: &Dispatcher) -> Result<()> {
        pump(
            || context.send_packet(packet),
            || {
                let frame = Frame::new()?;
                Ok(context.receive_frame(&frame)?.then_some(frame))
            },
            |frame| events.dispatch(CodecEvent::Frame(frame)),
            "avcodec_send_packet",
        )?;
        if packet.is_none() {
            events.dispatch(CodecEvent::Drained);
        }
        Ok(())
    }
}

/// Send one input and emit every output it makes available. When the codec
/// refuses the input until its output is read, the input is retried once
/// after reading.
fn pump<T>(
    send: impl Fn() -> Result<bool>,
    mut receive: impl FnMut() -> Result<Option<T>>,
    mut emit: impl FnMut(T),
    operation: &'static str,
) -> Result<()> {
    let mut accepted = send()?;
    let mut retried = false;
    loop {
        while let Some(output) = receive()? {
            emit(output);
        }
        if accepted {
            return Ok(());
        }
        if retried {
            return Err(Error::from_native(AVERROR_EAGAIN, operation));
        }
        accepted = send()?;
        retried = true;
    }
}

impl Drop for CodecWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avcodec::context::tests::{rawvideo_encoder, video_frame};

    #[test]
    fn test_dispatcher_queues_until_attached() {
        let dispatcher = Dispatcher::default();
        dispatcher.dispatch(CodecEvent::Drained);
        dispatcher.dispatch(CodecEvent::Error(Error::Channel("closed".into())));

        let (tx, rx) = crossbeam_channel::unbounded();
        dispatcher.attach(Box::new(move |event| tx.send(event).unwrap()));
        dispatcher.dispatch(CodecEvent::Drained);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], CodecEvent::Drained));
        assert!(matches!(events[1], CodecEvent::Error(Error::Channel(_))));
        assert!(matches!(events[2], CodecEvent::Drained));
    }

    #[test]
    fn test_pump_retries_once() {
        let mut calls = 0;
        let sends = std::cell::Cell::new(0);
        let result = pump(
            || {
                sends.set(sends.get() + 1);
                Ok(sends.get() > 1)
            },
            || {
                calls += 1;
                Ok(None::<u8>)
            },
            |_| {},
            "drain",
        );
        assert!(result.is_ok());
        assert_eq!(sends.get(), 2);
        assert_eq!(calls, 2);

        let refused = pump(|| Ok(false), || Ok(None::<u8>), |_| {}, "drain");
        assert!(matches!(refused, Err(e) if e.is_again()));
    }

    #[test]
    fn test_encode_in_order_with_late_handler() {
        let Some(encoder) = rawvideo_encoder() else {
            return;
        };
        let worker = CodecWorker::spawn(encoder).unwrap();
        for pts in 0..3 {
            worker.submit_frame(Some(video_frame(pts))).unwrap();
        }
        worker.submit_frame(None).unwrap();
        worker.shutdown();

        let (tx, rx) = crossbeam_channel::unbounded();
        worker.on_event(move |event| tx.send(event).unwrap());

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        for (pts, event) in events[..3].iter().enumerate() {
            match event {
                CodecEvent::Packet(packet) => {
                    assert_eq!(packet.pts().unwrap(), Some(pts as i64));
                }
                other => panic!("expected a packet, got {:?}", other),
            }
        }
        assert!(matches!(events[3], CodecEvent::Drained));
    }

    #[test]
    fn test_native_failure_becomes_event() {
        let Some(encoder) = rawvideo_encoder() else {
            return;
        };
        let worker = CodecWorker::spawn(encoder).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        worker.on_event(move |event| tx.send(event).unwrap());

        let packet = Packet::from_data(&[0; 8]).unwrap();
        worker.submit_packet(Some(packet)).unwrap();
        worker.shutdown();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CodecEvent::Error(Error::Native {
                operation: "avcodec_send_packet",
                ..
            })
        ));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let Some(encoder) = rawvideo_encoder() else {
            return;
        };
        let worker = CodecWorker::spawn(encoder).unwrap();
        worker.shutdown();
        worker.shutdown();
        assert!(matches!(
            worker.submit_frame(None),
            Err(Error::Channel(_))
        ));
    }
}
