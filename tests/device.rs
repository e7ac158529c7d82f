//! Device-context table consistency against a mock rendering device.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use vertexcache::{
    DeviceContext, DeviceId, GraphicsDevice, Registry, UsageHint, VertexBuffer, VertexColumn,
    VertexDataConfig, VertexFormat,
};

/// A mock device: tracks queued buffers and live contexts the way a real
/// prepared-objects table would, holding buffers only weakly.
struct MockDevice {
    weak_self: Mutex<Weak<MockDevice>>,
    queued: Mutex<HashSet<u64>>,
    contexts: Mutex<HashMap<u64, Weak<VertexBuffer>>>,
    next_context: AtomicU64,
    refuse_prepare: bool,
}

impl MockDevice {
    fn create(refuse_prepare: bool) -> Arc<MockDevice> {
        let device = Arc::new(MockDevice {
            weak_self: Mutex::new(Weak::new()),
            queued: Mutex::new(HashSet::new()),
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            refuse_prepare,
        });
        *device.weak_self.lock() = Arc::downgrade(&device);
        device
    }

    fn device_id(&self) -> DeviceId {
        let me: Arc<dyn GraphicsDevice> =
            self.weak_self.lock().upgrade().expect("device is alive");
        DeviceId::of(&me)
    }

    fn num_contexts(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl GraphicsDevice for MockDevice {
    fn enqueue_vertex_buffer(&self, buffer: &Arc<VertexBuffer>) {
        self.queued.lock().insert(buffer.id().raw());
    }

    fn is_vertex_buffer_queued(&self, buffer: &Arc<VertexBuffer>) -> bool {
        self.queued.lock().contains(&buffer.id().raw())
    }

    fn dequeue_vertex_buffer(&self, buffer: &Arc<VertexBuffer>) -> bool {
        self.queued.lock().remove(&buffer.id().raw())
    }

    fn prepare_vertex_buffer_now(&self, buffer: &Arc<VertexBuffer>) -> Option<DeviceContext> {
        if self.refuse_prepare {
            return None;
        }
        self.queued.lock().remove(&buffer.id().raw());
        let raw = self.next_context.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(raw, Arc::downgrade(buffer));
        Some(DeviceContext::new(raw))
    }

    fn release_vertex_buffer(&self, context: DeviceContext) {
        let buffer = self.contexts.lock().remove(&context.raw());
        if let Some(buffer) = buffer.and_then(|weak| weak.upgrade()) {
            buffer.clear_prepared(self.device_id());
        }
    }
}

fn setup() -> (Arc<Registry>, Arc<VertexBuffer>) {
    let registry = Registry::new(VertexDataConfig::default());
    let format = registry.register_format(VertexFormat::new(vec![VertexColumn::new(0, 1, 1)], 1));
    let buffer = registry.create_buffer(format, UsageHint::Static);
    (registry, buffer)
}

#[test]
fn test_prepare_enqueues_on_device() {
    let (_registry, buffer) = setup();
    let device: Arc<dyn GraphicsDevice> = MockDevice::create(false);

    assert!(!buffer.is_prepared(&device));
    buffer.prepare(&device);
    assert!(buffer.is_prepared(&device));
    // Queued is not yet a context.
    assert_eq!(buffer.num_contexts(), 0);
}

#[test]
fn test_prepare_now_twice_returns_same_context() {
    let (_registry, buffer) = setup();
    let device: Arc<dyn GraphicsDevice> = MockDevice::create(false);

    let first = buffer.prepare_now(&device).expect("device should accept");
    let second = buffer.prepare_now(&device).expect("device should accept");
    assert_eq!(first, second);
    assert_eq!(buffer.num_contexts(), 1);
    assert!(buffer.is_prepared(&device));
}

#[test]
fn test_prepare_now_refusal() {
    let (_registry, buffer) = setup();
    let device: Arc<dyn GraphicsDevice> = MockDevice::create(true);

    assert!(buffer.prepare_now(&device).is_none());
    assert_eq!(buffer.num_contexts(), 0);
}

#[test]
fn test_release_frees_context_on_both_sides() {
    let (_registry, buffer) = setup();
    let mock = MockDevice::create(false);
    let device: Arc<dyn GraphicsDevice> = mock.clone();

    buffer.prepare_now(&device).unwrap();
    assert!(buffer.release(&device));
    assert_eq!(buffer.num_contexts(), 0);
    assert_eq!(mock.num_contexts(), 0);
    assert!(!buffer.is_prepared(&device));
}

#[test]
fn test_release_falls_back_to_dequeue() {
    let (_registry, buffer) = setup();
    let device: Arc<dyn GraphicsDevice> = MockDevice::create(false);

    buffer.prepare(&device);
    // No context yet, but the queue entry is dropped.
    assert!(buffer.release(&device));
    assert!(!buffer.is_prepared(&device));
    // Nothing left to release.
    assert!(!buffer.release(&device));
}

#[test]
fn test_release_all_empties_table() {
    let (_registry, buffer) = setup();
    let mock_a = MockDevice::create(false);
    let mock_b = MockDevice::create(false);
    let device_a: Arc<dyn GraphicsDevice> = mock_a.clone();
    let device_b: Arc<dyn GraphicsDevice> = mock_b.clone();

    buffer.prepare_now(&device_a).unwrap();
    buffer.prepare_now(&device_b).unwrap();
    assert_eq!(buffer.num_contexts(), 2);

    assert_eq!(buffer.release_all(), 2);
    assert_eq!(buffer.num_contexts(), 0);
    assert_eq!(mock_a.num_contexts(), 0);
    assert_eq!(mock_b.num_contexts(), 0);
}

#[test]
fn test_buffer_drop_releases_device_contexts() {
    let (_registry, buffer) = setup();
    let mock = MockDevice::create(false);
    let device: Arc<dyn GraphicsDevice> = mock.clone();

    buffer.prepare_now(&device).unwrap();
    assert_eq!(mock.num_contexts(), 1);
    drop(buffer);
    assert_eq!(mock.num_contexts(), 0);
}

#[test]
fn test_contexts_are_per_device() {
    let (_registry, buffer) = setup();
    let device_a: Arc<dyn GraphicsDevice> = MockDevice::create(false);
    let device_b: Arc<dyn GraphicsDevice> = MockDevice::create(false);

    let context_a = buffer.prepare_now(&device_a).unwrap();
    assert!(!buffer.is_prepared(&device_b));
    let context_b = buffer.prepare_now(&device_b).unwrap();
    assert_eq!(buffer.num_contexts(), 2);
    // Releasing one device leaves the other's context alone.
    assert!(buffer.release(&device_a));
    assert_eq!(buffer.num_contexts(), 1);
    assert_eq!(buffer.prepare_now(&device_b), Some(context_b));
    assert_ne!(Some(context_a), buffer.prepare_now(&device_a));
}
