//! Optional, one-shot registration of the container with
//! `systemd-machined` over the system message bus. Every failure here is
//! logged and swallowed — the jail runs identically whether or not the
//! host has machined.

use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::Value;

/// Calls `org.freedesktop.machine1.Manager.CreateMachine` describing the
/// freshly-cloned child. Never returns an error to the caller.
pub fn register(pid: i32, root_dir: Option<&str>) {
    if let Err(e) = try_register(pid, root_dir) {
        log::warn!("machined registration skipped: {}", e);
    }
}

fn try_register(pid: i32, root_dir: Option<&str>) -> zbus::Result<()> {
    let conn = Connection::system()?;

    let proxy = Proxy::new(
        &conn,
        "org.freedesktop.machine1",
        "/org/freedesktop/machine1",
        "org.freedesktop.machine1.Manager",
    )?;

    let name = format!("pflask-{}", pid);
    let uuid = [0u8; 16];
    let scope_properties: Vec<(&str, Value)> = Vec::new();

    proxy.call::<_, _, zbus::zvariant::OwnedObjectPath>(
        "CreateMachine",
        &(
            name.as_str(),
            &uuid[..],
            "pflask",
            "container",
            pid as u32,
            root_dir.unwrap_or(""),
            &scope_properties[..],
        ),
    )?;

    Ok(())
}
