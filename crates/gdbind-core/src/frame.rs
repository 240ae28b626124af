//! Call frames
//!
//! A frame is a linear run of fixed-width argument slots plus one return
//! slot. Arguments are appended in declaration order with no reordering or
//! padding elision, so a frame of `K` arguments always occupies
//! `K * SLOT_WIDTH + SLOT_WIDTH` bytes.

use gdbind_sdk::{ConstTypePtr, MethodBind, ObjectPtr, Slot, SLOT_WIDTH};

use crate::marshal::{FromReturn, MarshalError, PushArg};
use crate::scope::LifetimeScope;

/// Maximum number of arguments in one frame
pub const FRAME_CAPACITY: usize = 16;

/// Argument and return slots for one pointer call.
///
/// Temporaries created while pushing arguments (and resources decoded from
/// the return slot) live in the borrowed [`LifetimeScope`].
pub struct CallFrame<'s> {
    scope: &'s LifetimeScope,
    args: [Slot; FRAME_CAPACITY],
    len: usize,
    ret: Slot,
}

impl<'s> CallFrame<'s> {
    /// Empty frame whose temporaries belong to `scope`
    pub fn new(scope: &'s LifetimeScope) -> Self {
        CallFrame {
            scope,
            args: [Slot::ZERO; FRAME_CAPACITY],
            len: 0,
            ret: Slot::ZERO,
        }
    }

    /// Append an argument.
    pub fn push<A: PushArg>(&mut self, arg: A) -> Result<&mut Self, MarshalError> {
        if self.len == FRAME_CAPACITY {
            return Err(MarshalError::FrameFull {
                capacity: FRAME_CAPACITY,
            });
        }
        arg.write(self.scope, &mut self.args[self.len])?;
        self.len += 1;
        Ok(self)
    }

    /// Number of arguments pushed
    pub fn arg_count(&self) -> usize {
        self.len
    }

    /// Whether no arguments were pushed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes occupied by the arguments plus the return slot
    pub fn size_bytes(&self) -> usize {
        self.len * SLOT_WIDTH + SLOT_WIDTH
    }

    /// Argument slots pushed so far
    pub fn args(&self) -> &[Slot] {
        &self.args[..self.len]
    }

    /// The return slot
    pub fn ret_slot(&self) -> &Slot {
        &self.ret
    }

    /// Scope owning the frame's temporaries
    pub fn scope(&self) -> &'s LifetimeScope {
        self.scope
    }

    /// Pointer array in the layout the pointer-call ABI expects.
    pub fn arg_pointers(&self) -> [ConstTypePtr; FRAME_CAPACITY] {
        let mut pointers = [std::ptr::null(); FRAME_CAPACITY];
        for (pointer, slot) in pointers.iter_mut().zip(self.args()) {
            *pointer = slot.as_const_ptr();
        }
        pointers
    }

    /// Issue the call. The return slot is zeroed first.
    ///
    /// # Safety
    /// The pushed argument types and the type later read with
    /// [`CallFrame::ret`] must match the bound method's native signature
    /// exactly. This cannot be checked here.
    pub unsafe fn ptrcall(&mut self, bind: MethodBind, object: Option<ObjectPtr>) {
        let pointers = self.arg_pointers();
        self.ret = Slot::ZERO;
        tracing::trace!(target: "gdbind::frame", ?bind, ?object, args = self.len, "ptrcall");
        self.scope
            .arena()
            .host()
            .object_method_bind_ptrcall(bind, object, pointers.as_ptr(), self.ret.as_mut_ptr());
    }

    /// Decode the return slot as the call-site's declared type.
    pub fn ret<R: FromReturn>(&self) -> Result<R, MarshalError> {
        R::read(&self.ret, self.scope)
    }

    /// Reset for reuse with the same scope
    pub fn clear(&mut self) {
        self.args[..self.len].fill(Slot::ZERO);
        self.len = 0;
        self.ret = Slot::ZERO;
    }
}

impl std::fmt::Debug for CallFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFrame")
            .field("args", &self.args())
            .field("ret", &self.ret)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::owned::{GString, Owned};
    use gdbind_sdk::mock::MockHost;
    use gdbind_sdk::{AbiLayout, HostInterface, ResourceKind, Vector2};
    use std::sync::Arc;

    fn setup() -> (Arc<MockHost>, Arc<Arena>) {
        let host = Arc::new(MockHost::new());
        let arena = Arc::new(Arena::new(host.clone(), AbiLayout::default()).unwrap());
        (host, arena)
    }

    #[test]
    fn test_frame_size() {
        let (_host, arena) = setup();
        let scope = LifetimeScope::new(arena);
        let mut frame = CallFrame::new(&scope);
        assert_eq!(frame.size_bytes(), SLOT_WIDTH);

        frame.push(1i32).unwrap().push(2.0f32).unwrap().push(true).unwrap();
        assert_eq!(frame.arg_count(), 3);
        assert_eq!(frame.size_bytes(), 3 * SLOT_WIDTH + SLOT_WIDTH);
    }

    #[test]
    fn test_frame_capacity() {
        let (_host, arena) = setup();
        let scope = LifetimeScope::new(arena);
        let mut frame = CallFrame::new(&scope);
        for i in 0..FRAME_CAPACITY {
            frame.push(i as i64).unwrap();
        }
        let err = frame.push(0i64).unwrap_err();
        assert_eq!(err, MarshalError::FrameFull { capacity: FRAME_CAPACITY });
    }

    #[test]
    fn test_declaration_order() {
        let (_host, arena) = setup();
        let scope = LifetimeScope::new(arena);
        let mut frame = CallFrame::new(&scope);
        frame.push(10i64).unwrap();
        frame.push(Vector2::new(1.0, 2.0)).unwrap();

        let pointers = frame.arg_pointers();
        assert_eq!(pointers[0], frame.args()[0].as_const_ptr());
        assert_eq!(pointers[1], frame.args()[1].as_const_ptr());
        assert!(pointers[2].is_null());
        assert_eq!(frame.args()[0].read_pod::<i64>(), Some(10));
    }

    #[test]
    fn test_ptrcall_round_trip() {
        let (host, arena) = setup();
        host.define_class("Greeter", Some("Object"), false);
        let bind = host.define_method("Greeter", "greet", 7, 2, |call| {
            let name = call.arg_text(0).unwrap_or_default();
            let times = call.arg::<i64>(1);
            call.ret_text(&format!("{}x hello {}", times, name));
        });

        let scope = LifetimeScope::new(arena.clone());
        let mut frame = CallFrame::new(&scope);
        frame.push("world").unwrap().push(2i64).unwrap();
        unsafe { frame.ptrcall(bind, None) };

        let greeting: Owned<GString> = frame.ret().unwrap();
        assert_eq!(greeting.text().unwrap(), "2x hello world");
        drop(greeting);
        drop(frame);
        drop(scope);

        assert_eq!(host.destroyed(ResourceKind::String), 2);
        assert_eq!(arena.live_handles(), 0);
    }

    #[test]
    fn test_object_return_absent() {
        let (host, arena) = setup();
        host.define_class("Finder", Some("Object"), false);
        let bind = host.define_method("Finder", "find", 1, 0, |call| call.ret_object(None));
        let finder = host.classdb_construct_object("Finder");

        let scope = LifetimeScope::new(arena);
        let mut frame = CallFrame::new(&scope);
        unsafe { frame.ptrcall(bind, finder) };
        assert_eq!(frame.ret::<Option<ObjectPtr>>().unwrap(), None);
    }

    #[test]
    fn test_clear() {
        let (_host, arena) = setup();
        let scope = LifetimeScope::new(arena);
        let mut frame = CallFrame::new(&scope);
        frame.push(5u32).unwrap();
        frame.clear();
        assert!(frame.is_empty());
        assert_eq!(frame.size_bytes(), SLOT_WIDTH);
    }
}
