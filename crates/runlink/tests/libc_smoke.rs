// Smoke tests against the real C library through the system loader.

#![cfg(all(target_os = "linux", target_pointer_width = "64"))]

use pretty_assertions::assert_eq;
use runlink::{
    Binder, Buffer, CallError, FnShape, Kind, Library, LibraryNode, Loader, Node, Slot,
    SystemLoader, Value,
};

struct Libc {
    strlen: Slot,
    abs: Slot,
    strdup: Slot,
    getenv: Slot,
    snprintf: Slot,
    not_there: Slot,
}

impl Default for Libc {
    fn default() -> Self {
        let snprintf_shape =
            FnShape::new(vec![Kind::Buffer, Kind::U64, Kind::String], vec![Kind::I32]).variadic();
        Self {
            strlen: Slot::new("strlen func(#char)size_t"),
            abs: Slot::new("abs func(int)int"),
            strdup: Slot::new("strdup func(#char)$char"),
            getenv: Slot::new("getenv func(#char)*char"),
            snprintf: Slot::with_shape(
                "snprintf func(&uchar[>=@2],size_t,#char...f@3)int",
                snprintf_shape,
            ),
            not_there: Slot::new("runlink_no_such_symbol func()void"),
        }
    }
}

unsafe impl LibraryNode for Libc {
    fn describe<'a>(&'a mut self, node: &mut Node<'a>) {
        node.library("c")
            .location("linux", "libc.so.6")
            .slot("strlen", &mut self.strlen)
            .slot("abs", &mut self.abs)
            .slot("strdup", &mut self.strdup)
            .slot("getenv", &mut self.getenv)
            .slot("snprintf", &mut self.snprintf)
            .slot("not_there", &mut self.not_there);
    }
}

fn libc() -> Library<Libc> {
    Binder::new().with_platform("linux").open(&[])
}

#[test]
fn test_system_loader_finds_libc() {
    let loader = SystemLoader::new();
    let library = loader.open("libc.so.6").unwrap();
    assert!(library.symbol("strlen").is_some());
    assert!(library.symbol("runlink_no_such_symbol").is_none());
    assert_eq!(loader.loaded_count(), 1);
}

#[test]
fn test_scalar_and_string_calls() {
    let lib = libc();
    assert_eq!(lib.report().bound(), 5);
    assert!(!lib.not_there.is_set());

    let len = lib.strlen.call(&[Value::from("runlink")]).unwrap();
    assert_eq!(len, vec![Value::U64(7)]);

    let abs = lib.abs.call(&[Value::I32(-12)]).unwrap();
    assert_eq!(abs, vec![Value::I32(12)]);

    let copy = lib.strdup.call(&[Value::from("copied")]).unwrap();
    assert_eq!(copy, vec![Value::from("copied")]);

    let missing = lib
        .getenv
        .call(&[Value::from("RUNLINK_SURELY_UNSET_VARIABLE")])
        .unwrap();
    assert_eq!(missing, vec![Value::from("")]);
}

#[test]
fn test_variadic_snprintf() {
    let lib = libc();
    let buffer = Buffer::new(32);
    let written = lib
        .snprintf
        .call(&[
            Value::Buffer(buffer.clone()),
            Value::U64(32),
            Value::from("%d-%s-%.1f"),
            Value::I32(42),
            Value::from("x"),
            Value::F64(2.5),
        ])
        .unwrap();
    assert_eq!(written, vec![Value::I32(8)]);
    assert_eq!(buffer.to_string_lossy(), "42-x-2.5");
}

#[test]
fn test_snprintf_format_is_checked_before_the_call() {
    let lib = libc();
    let buffer = Buffer::new(8);

    let too_few = lib.snprintf.call(&[
        Value::Buffer(buffer.clone()),
        Value::U64(8),
        Value::from("%d %d"),
        Value::I32(1),
    ]);
    assert!(matches!(too_few, Err(CallError::Assertion(_))));

    let oversized = lib.snprintf.call(&[
        Value::Buffer(buffer.clone()),
        Value::U64(64),
        Value::from("hi"),
    ]);
    assert!(matches!(oversized, Err(CallError::Assertion(ref a)) if a.arg == 1));
    assert_eq!(buffer.to_vec(), vec![0; 8]);
}
