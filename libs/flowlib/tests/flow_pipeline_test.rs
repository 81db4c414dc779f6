//! Flow Engine Integration Test
//!
//! Drives a static flow end-to-end through the public API: open, queued
//! dispatch, ordering guarantees, send validation, teardown. The main loop
//! is pumped explicitly so every dispatch pass is observable.

use flowlib::{
    Blob, FlowError, FlowRuntime, Node, NodeContext, NodeOptions, NodeType, OptionSpec,
    OptionsSchema, Packet, PacketType, PortDescriptor, StaticFlowBuilder,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

// =============================================================================
// Test-only nodes
// =============================================================================

#[derive(Debug, Deserialize)]
struct EmitterConfig {
    value: i32,
}

/// Emits one integer packet from port OUT during its open hook.
struct EmitterNode {
    log: Arc<Mutex<Vec<String>>>,
}

impl Node for EmitterNode {
    fn open(&mut self, ctx: &mut NodeContext, options: &NodeOptions) -> flowlib::Result<()> {
        let config: EmitterConfig = options.parse()?;
        self.log.lock().push(format!("open:{}", config.value));
        ctx.send(0, Packet::irange_value(config.value))
    }

    fn close(&mut self, _ctx: &mut NodeContext) {
        self.log.lock().push("close".into());
    }
}

fn emitter_type(log: Arc<Mutex<Vec<String>>>) -> Arc<NodeType> {
    Arc::new(
        NodeType::new("test/emitter", move || {
            Ok(Box::new(EmitterNode {
                log: Arc::clone(&log),
            }))
        })
        .with_out_ports(vec![PortDescriptor::new("OUT", PacketType::IRange)])
        .with_options(OptionsSchema::new(vec![OptionSpec::with_default(
            "value",
            json!(42),
        )])),
    )
}

/// Records every integer it receives, tagged with its own label.
struct RecorderNode {
    label: &'static str,
    log: Arc<Mutex<Vec<(&'static str, i32)>>>,
}

impl Node for RecorderNode {
    fn process(
        &mut self,
        _ctx: &mut NodeContext,
        _port: flowlib::PortId,
        _conn_id: flowlib::ConnId,
        packet: &Packet,
    ) -> flowlib::Result<()> {
        self.log.lock().push((self.label, packet.as_irange()?.val));
        Ok(())
    }
}

fn recorder_type(
    label: &'static str,
    log: Arc<Mutex<Vec<(&'static str, i32)>>>,
) -> Arc<NodeType> {
    Arc::new(
        NodeType::new("test/recorder", move || {
            Ok(Box::new(RecorderNode {
                label,
                log: Arc::clone(&log),
            }))
        })
        .with_in_ports(vec![PortDescriptor::new("IN", PacketType::IRange)]),
    )
}

/// Forwards each received integer, incremented by 100, in the next pass.
struct RelayNode;

impl Node for RelayNode {
    fn process(
        &mut self,
        ctx: &mut NodeContext,
        _port: flowlib::PortId,
        _conn_id: flowlib::ConnId,
        packet: &Packet,
    ) -> flowlib::Result<()> {
        let value = packet.as_irange()?.val;
        ctx.send(0, Packet::irange_value(value + 100))
    }
}

fn relay_type() -> Arc<NodeType> {
    Arc::new(
        NodeType::new("test/relay", || Ok(Box::new(RelayNode)))
            .with_in_ports(vec![PortDescriptor::new("IN", PacketType::IRange)])
            .with_out_ports(vec![PortDescriptor::new("OUT", PacketType::IRange)]),
    )
}

// =============================================================================
// Scenario: two-node pipeline
// =============================================================================

#[test]
fn two_node_pipeline_delivers_in_one_pass() {
    let runtime = FlowRuntime::new();
    let emitter_log = Arc::new(Mutex::new(Vec::new()));
    let record_log = Arc::new(Mutex::new(Vec::new()));

    let mut builder = StaticFlowBuilder::new("pipeline");
    let a = builder.add_node("a", emitter_type(Arc::clone(&emitter_log)), None);
    let b = builder.add_node("b", recorder_type("b", Arc::clone(&record_log)), None);
    builder.connect(a, 0, b, 0);
    let flow = builder.build().unwrap().as_node_type();

    let mut handle = runtime.open_flow(&flow, None).unwrap();
    assert!(record_log.lock().is_empty());

    // One dispatch pass delivers the packet emitted during open.
    assert!(runtime.main_loop().run_once());
    assert_eq!(*record_log.lock(), vec![("b", 42)]);
    assert!(!runtime.main_loop().run_once());

    handle.close();
    assert_eq!(*emitter_log.lock(), vec!["open:42", "close"]);
    // The only remaining holders of the logs are the test and the node-type
    // constructors; node instances are gone.
    assert_eq!(Arc::strong_count(&record_log), 2);
}

#[test]
fn emitter_options_resolve_against_schema() {
    let runtime = FlowRuntime::new();
    let emitter_log = Arc::new(Mutex::new(Vec::new()));
    let record_log = Arc::new(Mutex::new(Vec::new()));

    let mut options = flowlib::NamedOptions::new();
    options.insert("value".into(), json!(-3));

    let mut builder = StaticFlowBuilder::new("configured");
    let a = builder.add_node("a", emitter_type(Arc::clone(&emitter_log)), Some(options));
    let b = builder.add_node("b", recorder_type("b", Arc::clone(&record_log)), None);
    builder.connect(a, 0, b, 0);
    let flow = builder.build().unwrap().as_node_type();

    let _handle = runtime.open_flow(&flow, None).unwrap();
    runtime.main_loop().run_pending();
    assert_eq!(*record_log.lock(), vec![("b", -3)]);
}

// =============================================================================
// Ordering guarantees
// =============================================================================

/// Emits a burst of three packets from one open hook.
struct BurstNode;

impl Node for BurstNode {
    fn open(&mut self, ctx: &mut NodeContext, _options: &NodeOptions) -> flowlib::Result<()> {
        ctx.send(0, Packet::irange_value(1))?;
        ctx.send(0, Packet::irange_value(2))?;
        ctx.send(0, Packet::irange_value(3))
    }
}

fn burst_type() -> Arc<NodeType> {
    Arc::new(
        NodeType::new("test/burst", || Ok(Box::new(BurstNode)))
            .with_out_ports(vec![PortDescriptor::new("OUT", PacketType::IRange)]),
    )
}

#[test]
fn subscribers_see_fifo_order_in_connection_order() {
    let runtime = FlowRuntime::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut builder = StaticFlowBuilder::new("fanout");
    let src = builder.add_node("src", burst_type(), None);
    let r1 = builder.add_node("r1", recorder_type("r1", Arc::clone(&log)), None);
    let r2 = builder.add_node("r2", recorder_type("r2", Arc::clone(&log)), None);
    builder.connect(src, 0, r1, 0);
    builder.connect(src, 0, r2, 0);
    let flow = builder.build().unwrap().as_node_type();

    let _handle = runtime.open_flow(&flow, None).unwrap();
    runtime.main_loop().run_pending();

    // Per packet: every subscriber in connection order; per subscriber:
    // packets in send order.
    assert_eq!(
        *log.lock(),
        vec![
            ("r1", 1),
            ("r2", 1),
            ("r1", 2),
            ("r2", 2),
            ("r1", 3),
            ("r2", 3),
        ]
    );
}

#[test]
fn sends_during_dispatch_land_in_next_pass() {
    let runtime = FlowRuntime::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut builder = StaticFlowBuilder::new("chain");
    let a = builder.add_node("a", emitter_type(Arc::new(Mutex::new(Vec::new()))), None);
    let relay = builder.add_node("relay", relay_type(), None);
    let sink = builder.add_node("sink", recorder_type("sink", Arc::clone(&log)), None);
    builder.connect(a, 0, relay, 0);
    builder.connect(relay, 0, sink, 0);
    let flow = builder.build().unwrap().as_node_type();

    let _handle = runtime.open_flow(&flow, None).unwrap();

    // Pass 1: relay receives 42, re-sends 142 into a fresh queue.
    assert!(runtime.main_loop().run_once());
    assert!(log.lock().is_empty());
    // Pass 2: the sink sees it.
    assert!(runtime.main_loop().run_once());
    assert_eq!(*log.lock(), vec![("sink", 142)]);
}

// =============================================================================
// Send validation and teardown
// =============================================================================

/// Tries to send an integer from a boolean port and records the error code.
struct MistypedSender {
    observed: Arc<Mutex<Option<i32>>>,
}

impl Node for MistypedSender {
    fn open(&mut self, ctx: &mut NodeContext, _options: &NodeOptions) -> flowlib::Result<()> {
        let err = ctx
            .send(0, Packet::irange_value(1))
            .expect_err("type mismatch must fail synchronously");
        *self.observed.lock() = Some(err.code());
        Ok(())
    }
}

#[test]
fn send_with_mismatched_type_fails_synchronously() {
    let runtime = FlowRuntime::new();
    let observed = Arc::new(Mutex::new(None));
    let observed_node = Arc::clone(&observed);

    let ty = Arc::new(
        NodeType::new("test/mistyped", move || {
            Ok(Box::new(MistypedSender {
                observed: Arc::clone(&observed_node),
            }))
        })
        .with_out_ports(vec![PortDescriptor::new("FLAG", PacketType::Boolean)]),
    );

    let mut builder = StaticFlowBuilder::new("mistyped");
    builder.add_node("m", ty, None);
    let flow = builder.build().unwrap().as_node_type();

    let _handle = runtime.open_flow(&flow, None).unwrap();
    assert_eq!(
        *observed.lock(),
        Some(FlowError::InvalidType(String::new()).code())
    );
    // Nothing was enqueued.
    assert_eq!(runtime.main_loop().run_pending(), 0);
}

#[test]
fn unrouted_error_packet_is_disposed() {
    let runtime = FlowRuntime::new();

    struct ErrorEmitter;
    impl Node for ErrorEmitter {
        fn open(&mut self, ctx: &mut NodeContext, _options: &NodeOptions) -> flowlib::Result<()> {
            ctx.send(0, Packet::error(-5, Some("sensor gone".into())))
        }
    }
    let ty = Arc::new(
        NodeType::new("test/error-emitter", || Ok(Box::new(ErrorEmitter)))
            .with_out_ports(vec![PortDescriptor::new("ERROR", PacketType::Error)]),
    );

    let mut builder = StaticFlowBuilder::new("error-drop");
    builder.add_node("e", ty, None);
    let flow = builder.build().unwrap().as_node_type();

    let _handle = runtime.open_flow(&flow, None).unwrap();
    // The pass logs the unconsumed error packet and disposes it.
    runtime.main_loop().run_pending();
    assert_eq!(runtime.main_loop().pending(), 0);
}

#[test]
fn close_drains_queued_packets() {
    let runtime = FlowRuntime::new();
    let record_log = Arc::new(Mutex::new(Vec::new()));
    let blob = Blob::from_slice(b"queued payload");

    struct BlobEmitter {
        blob: Blob,
    }
    impl Node for BlobEmitter {
        fn open(&mut self, ctx: &mut NodeContext, _options: &NodeOptions) -> flowlib::Result<()> {
            ctx.send(0, Packet::blob(self.blob.clone()))
        }
    }
    struct BlobSink {
        log: Arc<Mutex<Vec<(&'static str, i32)>>>,
    }
    impl Node for BlobSink {
        fn process(
            &mut self,
            _ctx: &mut NodeContext,
            _port: flowlib::PortId,
            _conn_id: flowlib::ConnId,
            _packet: &Packet,
        ) -> flowlib::Result<()> {
            self.log.lock().push(("blob", 0));
            Ok(())
        }
    }

    let emit_blob = blob.clone();
    let emitter = Arc::new(
        NodeType::new("test/blob-emitter", move || {
            Ok(Box::new(BlobEmitter {
                blob: emit_blob.clone(),
            }))
        })
        .with_out_ports(vec![PortDescriptor::new("OUT", PacketType::Blob)]),
    );
    let sink_log = Arc::clone(&record_log);
    let sink = Arc::new(
        NodeType::new("test/blob-sink", move || {
            Ok(Box::new(BlobSink {
                log: Arc::clone(&sink_log),
            }))
        })
        .with_in_ports(vec![PortDescriptor::new("IN", PacketType::Blob)]),
    );

    let mut builder = StaticFlowBuilder::new("drain");
    let e = builder.add_node("e", emitter, None);
    let s = builder.add_node("s", sink, None);
    builder.connect(e, 0, s, 0);
    let flow = builder.build().unwrap().as_node_type();

    let mut handle = runtime.open_flow(&flow, None).unwrap();
    // Close before pumping: the queued packet is disposed, never delivered.
    handle.close();
    drop(flow);
    runtime.main_loop().run_pending();
    assert!(record_log.lock().is_empty());
    // Only the test and the emitter constructor hold the blob now.
    assert_eq!(blob.refcount(), 2);
}

#[test]
fn engine_state_reports_connected_while_open() {
    let runtime = FlowRuntime::new();
    let mut builder = StaticFlowBuilder::new("stateful");
    builder.add_node("b", burst_type(), None);
    let flow = builder.build().unwrap().as_node_type();

    let mut handle = runtime.open_flow(&flow, None).unwrap();
    assert_eq!(handle.engine_state(), Some(flowlib::EngineState::Connected));
    handle.close();
    assert_eq!(handle.engine_state(), Some(flowlib::EngineState::Closed));
    assert!(!handle.is_open());
}

#[test]
fn open_failure_unwinds_opened_children() {
    let runtime = FlowRuntime::new();
    let emitter_log = Arc::new(Mutex::new(Vec::new()));

    struct FailingNode;
    impl Node for FailingNode {
        fn open(&mut self, _ctx: &mut NodeContext, _options: &NodeOptions) -> flowlib::Result<()> {
            Err(FlowError::NotSupported("always fails".into()))
        }
    }
    let failing = Arc::new(NodeType::new("test/failing", || Ok(Box::new(FailingNode))));

    let mut builder = StaticFlowBuilder::new("unwind");
    builder.add_node("a", emitter_type(Arc::clone(&emitter_log)), None);
    builder.add_node("bad", failing, None);
    let flow = builder.build().unwrap().as_node_type();

    let err = runtime.open_flow(&flow, None).unwrap_err();
    assert!(matches!(err, FlowError::NotSupported(_)));
    // The successfully opened emitter was closed during the unwind.
    assert_eq!(*emitter_log.lock(), vec!["open:42", "close"]);
    // Its queued packet was drained, not dispatched.
    assert_eq!(runtime.main_loop().run_pending(), 0);
}
