//! Binds a handful of C library functions and calls them.
//!
//! Run with: cargo run --example bind_libc -p runlink
//!
//! Set `RUNLINK_LOG=runlink=debug` to watch discovery and symbol resolution.

use runlink::logging::init_logging_from;
use runlink::{Binder, Buffer, FnShape, Kind, Library, LibraryNode, Node, Slot, Value};
use runlink_config::ConfigLoader;

struct Libc {
    strlen: Slot,
    abs: Slot,
    getenv: Slot,
    snprintf: Slot,
}

impl Default for Libc {
    fn default() -> Self {
        let snprintf =
            FnShape::new(vec![Kind::Buffer, Kind::U64, Kind::String], vec![Kind::I32]).variadic();
        Self {
            strlen: Slot::new("strlen func(#char)size_t"),
            abs: Slot::new("abs func(int)int"),
            getenv: Slot::new("getenv func(#char)*char"),
            snprintf: Slot::with_shape("snprintf func(&uchar[>=@2],size_t,#char...f@3)int", snprintf),
        }
    }
}

unsafe impl LibraryNode for Libc {
    fn describe<'a>(&'a mut self, node: &mut Node<'a>) {
        node.library("c")
            .locations(&[
                ("linux", "libc.so.6"),
                ("macos", "libSystem.dylib"),
                ("windows", "msvcrt.dll"),
            ])
            .slot("strlen", &mut self.strlen)
            .slot("abs", &mut self.abs)
            .slot("getenv", &mut self.getenv)
            .slot("snprintf", &mut self.snprintf);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let config = ConfigLoader::new().load_from_directory(&cwd)?;
    init_logging_from(&config);

    let libc: Library<Libc> = Binder::from_config(config).open(&[]);
    println!("{}", libc.report().to_json()?);

    if libc.strlen.is_set() {
        let len = libc.strlen.call(&[Value::from("runlink")])?;
        println!("strlen(\"runlink\") = {:?}", len);
    }
    if libc.abs.is_set() {
        println!("abs(-42) = {:?}", libc.abs.call(&[Value::I32(-42)])?);
    }
    if libc.getenv.is_set() {
        println!("getenv(\"HOME\") = {:?}", libc.getenv.call(&[Value::from("HOME")])?);
    }
    if libc.snprintf.is_set() {
        let buffer = Buffer::new(64);
        libc.snprintf.call(&[
            Value::Buffer(buffer.clone()),
            Value::U64(64),
            Value::from("%s has %d bytes"),
            Value::from("buffer"),
            Value::I32(64),
        ])?;
        println!("snprintf -> {}", buffer.to_string_lossy());
    }

    libc.close();
    Ok(())
}
