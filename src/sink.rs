// SPDX-License-Identifier: GPL-3.0-only

//! Client sink interface and delivery gating
//!
//! Everything the HAL pushes to its client goes through [`CameraSink`].
//! Deliveries are filtered twice before they reach the sink: the client's
//! message mask drops classes it never asked for, and the callback gate
//! suppresses everything while a start/stop/parameter transition is in
//! flight so the client never observes a half-applied state.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{BufferDescriptor, MessageKind};

/// Event classes delivered through `on_notify`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Error,
    Shutter,
    Focus,
    FocusMove,
    Zoom,
}

impl NotifyKind {
    /// Message-mask bit gating this notification
    pub fn message(self) -> MessageKind {
        match self {
            NotifyKind::Error => MessageKind::ERROR,
            NotifyKind::Shutter => MessageKind::SHUTTER,
            NotifyKind::Focus => MessageKind::FOCUS,
            NotifyKind::FocusMove => MessageKind::FOCUS_MOVE,
            NotifyKind::Zoom => MessageKind::ZOOM,
        }
    }
}

/// Event classes delivered through `on_data` / `on_data_timestamp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    PreviewFrame,
    PreviewMetadata,
    VideoFrame,
    CompressedImage,
    PostviewFrame,
    RawImage,
}

impl DataKind {
    pub fn message(self) -> MessageKind {
        match self {
            DataKind::PreviewFrame => MessageKind::PREVIEW_FRAME,
            DataKind::PreviewMetadata => MessageKind::PREVIEW_METADATA,
            DataKind::VideoFrame => MessageKind::VIDEO_FRAME,
            DataKind::CompressedImage => MessageKind::COMPRESSED_IMAGE,
            DataKind::PostviewFrame => MessageKind::POSTVIEW_FRAME,
            DataKind::RawImage => MessageKind::RAW_IMAGE,
        }
    }
}

/// Client-implemented delivery surface
///
/// Implementations must be cheap and non-blocking; deliveries happen on
/// the capture and picture threads.
pub trait CameraSink: Send + Sync {
    fn on_notify(&self, kind: NotifyKind, arg1: i32, arg2: i32);
    fn on_data(&self, kind: DataKind, buffer: &BufferDescriptor);
    fn on_data_timestamp(&self, timestamp_ns: i64, kind: DataKind, buffer: &BufferDescriptor);
}

/// Suppression flag held across session state transitions
///
/// Holds nest; deliveries resume once every guard is dropped.
#[derive(Debug, Clone, Default)]
pub struct CallbackGate {
    holds: Arc<AtomicU32>,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress deliveries until the returned guard drops
    pub fn hold(&self) -> CallbackGateGuard {
        self.holds.fetch_add(1, Ordering::SeqCst);
        CallbackGateGuard {
            holds: Arc::clone(&self.holds),
        }
    }

    pub fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }
}

pub struct CallbackGateGuard {
    holds: Arc<AtomicU32>,
}

impl Drop for CallbackGateGuard {
    fn drop(&mut self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mask- and gate-aware front end the pipeline delivers through
#[derive(Clone)]
pub struct SinkDispatcher {
    sink: Arc<dyn CameraSink>,
    messages: Arc<AtomicU32>,
    gate: CallbackGate,
}

impl SinkDispatcher {
    pub fn new(sink: Arc<dyn CameraSink>, messages: Arc<AtomicU32>, gate: CallbackGate) -> Self {
        Self { sink, messages, gate }
    }

    /// The client's current interest in a message class
    pub fn is_enabled(&self, message: MessageKind) -> bool {
        MessageKind(self.messages.load(Ordering::SeqCst)).contains(message)
    }

    fn deliverable(&self, message: MessageKind) -> bool {
        self.is_enabled(message) && !self.gate.is_held()
    }

    pub fn notify(&self, kind: NotifyKind, arg1: i32, arg2: i32) {
        if self.deliverable(kind.message()) {
            self.sink.on_notify(kind, arg1, arg2);
        }
    }

    pub fn data(&self, kind: DataKind, buffer: &BufferDescriptor) {
        if self.deliverable(kind.message()) {
            self.sink.on_data(kind, buffer);
        }
    }

    /// Returns false when the delivery was masked or gated, so the caller
    /// can release the frame itself
    pub fn data_timestamp(&self, timestamp_ns: i64, kind: DataKind, buffer: &BufferDescriptor) -> bool {
        if !self.deliverable(kind.message()) {
            return false;
        }
        self.sink.on_data_timestamp(timestamp_ns, kind, buffer);
        true
    }
}

/// One recorded delivery, as seen by [`RecordingSink`]
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Notify {
        kind: NotifyKind,
        arg1: i32,
        arg2: i32,
    },
    Data {
        kind: DataKind,
        buffer: BufferDescriptor,
    },
    DataTimestamp {
        kind: DataKind,
        timestamp_ns: i64,
        buffer: BufferDescriptor,
    },
}

/// Sink that records every delivery, for integration tests
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn notify_count(&self, kind: NotifyKind) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SinkEvent::Notify { kind: k, .. } if *k == kind))
            .count()
    }

    pub fn data_count(&self, kind: DataKind) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, SinkEvent::Data { kind: k, .. } if *k == kind)
                    || matches!(event, SinkEvent::DataTimestamp { kind: k, .. } if *k == kind)
            })
            .count()
    }

    fn push(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl CameraSink for RecordingSink {
    fn on_notify(&self, kind: NotifyKind, arg1: i32, arg2: i32) {
        self.push(SinkEvent::Notify { kind, arg1, arg2 });
    }

    fn on_data(&self, kind: DataKind, buffer: &BufferDescriptor) {
        self.push(SinkEvent::Data {
            kind,
            buffer: buffer.clone(),
        });
    }

    fn on_data_timestamp(&self, timestamp_ns: i64, kind: DataKind, buffer: &BufferDescriptor) {
        self.push(SinkEvent::DataTimestamp {
            kind,
            timestamp_ns,
            buffer: buffer.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Geometry, PixelFormat};

    fn descriptor() -> BufferDescriptor {
        BufferDescriptor::bytes(
            Arc::from(vec![0u8; 8].into_boxed_slice()),
            0,
            Geometry::new(2, 2),
            PixelFormat::Nv21,
        )
    }

    fn dispatcher(mask: MessageKind) -> (SinkDispatcher, Arc<RecordingSink>, CallbackGate) {
        let sink = Arc::new(RecordingSink::new());
        let gate = CallbackGate::new();
        let dispatcher = SinkDispatcher::new(
            Arc::clone(&sink) as Arc<dyn CameraSink>,
            Arc::new(AtomicU32::new(mask.0)),
            gate.clone(),
        );
        (dispatcher, sink, gate)
    }

    #[test]
    fn mask_filters_deliveries() {
        let (dispatcher, sink, _gate) = dispatcher(MessageKind::SHUTTER);
        dispatcher.notify(NotifyKind::Shutter, 0, 0);
        dispatcher.notify(NotifyKind::Focus, 1, 0);
        dispatcher.data(DataKind::PreviewFrame, &descriptor());
        assert_eq!(sink.notify_count(NotifyKind::Shutter), 1);
        assert_eq!(sink.notify_count(NotifyKind::Focus), 0);
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 0);
    }

    #[test]
    fn gate_suppresses_while_held() {
        let (dispatcher, sink, gate) = dispatcher(MessageKind::ALL);
        {
            let _guard = gate.hold();
            dispatcher.notify(NotifyKind::Shutter, 0, 0);
            assert!(!dispatcher.data_timestamp(1, DataKind::VideoFrame, &descriptor()));
        }
        dispatcher.notify(NotifyKind::Shutter, 0, 0);
        assert_eq!(sink.notify_count(NotifyKind::Shutter), 1);
        assert_eq!(sink.data_count(DataKind::VideoFrame), 0);
    }

    #[test]
    fn nested_holds_release_in_order() {
        let gate = CallbackGate::new();
        let outer = gate.hold();
        let inner = gate.hold();
        drop(inner);
        assert!(gate.is_held());
        drop(outer);
        assert!(!gate.is_held());
    }

    #[test]
    fn timestamp_delivery_reports_success() {
        let (dispatcher, sink, _gate) = dispatcher(MessageKind::VIDEO_FRAME);
        assert!(dispatcher.data_timestamp(42, DataKind::VideoFrame, &descriptor()));
        assert_eq!(sink.data_count(DataKind::VideoFrame), 1);
    }
}
