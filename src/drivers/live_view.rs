use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::drivers::{SampleSink, SharedViewport, SinkError, ViewportState};
use crate::types::{SamplePoint, SampleEvent, ViewFrame};

/// Whatever draws the frames. Being unready is not an error; the frame is just skipped.
pub trait ViewFrontend: Send {
    fn is_ready(&self) -> bool;
    fn render(&mut self, frame: ViewFrame) -> Result<(), SinkError>;
}

/// Frontend that forwards frames to a channel; goes unready once the receiver is dropped.
pub struct ChannelFrontend {
    tx: Sender<ViewFrame>,
    connected: bool,
}

impl ChannelFrontend {
    pub fn new(tx: Sender<ViewFrame>) -> Self {
        Self {
            tx,
            connected: true,
        }
    }
}

impl ViewFrontend for ChannelFrontend {
    fn is_ready(&self) -> bool {
        self.connected
    }

    fn render(&mut self, frame: ViewFrame) -> Result<(), SinkError> {
        if self.tx.send(frame).is_err() {
            self.connected = false;
        }
        Ok(())
    }
}

/// Keeps a bounded copy of recent samples and rolling averages and hands the frontend the
/// slice that falls inside the current viewport.
pub struct LiveViewSink<F: ViewFrontend> {
    viewport: SharedViewport,
    frontend: F,
    samples: VecDeque<SamplePoint>,
    averages: VecDeque<SamplePoint>,
    history: usize,
}

impl<F: ViewFrontend> LiveViewSink<F> {
    pub fn new(viewport: SharedViewport, frontend: F, history: usize) -> Self {
        let history = history.max(1);
        Self {
            viewport,
            frontend,
            samples: VecDeque::with_capacity(history),
            averages: VecDeque::with_capacity(history),
            history,
        }
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Records the sample and, if the frontend can take it, renders the visible window.
    pub fn update(&mut self, event: &SampleEvent, viewport: ViewportState) -> Result<(), SinkError> {
        let sequence = event.sample.sequence;
        push_bounded(
            &mut self.samples,
            self.history,
            SamplePoint {
                sequence,
                value: event.sample.physical_value,
            },
        );
        if let Some(avg) = event.rolling_average {
            push_bounded(
                &mut self.averages,
                self.history,
                SamplePoint {
                    sequence,
                    value: avg,
                },
            );
        }
        if !self.frontend.is_ready() {
            return Ok(());
        }
        let frame = ViewFrame {
            latest: event.sample,
            viewport,
            samples: visible(&self.samples, &viewport),
            averages: visible(&self.averages, &viewport),
        };
        self.frontend.render(frame)
    }
}

impl<F: ViewFrontend> SampleSink for LiveViewSink<F> {
    fn name(&self) -> &str {
        "live_view"
    }

    fn accept(&mut self, event: &SampleEvent, _timeout: Duration) -> Result<(), SinkError> {
        let viewport = self
            .viewport
            .lock()
            .tick(event.sample.sequence, Instant::now());
        self.update(event, viewport)
    }
}

fn push_bounded(buffer: &mut VecDeque<SamplePoint>, capacity: usize, point: SamplePoint) {
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(point);
}

fn visible(points: &VecDeque<SamplePoint>, viewport: &ViewportState) -> Vec<SamplePoint> {
    points
        .iter()
        .filter(|p| viewport.contains(p.sequence as f64))
        .copied()
        .collect()
}
