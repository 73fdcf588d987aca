use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::error::{Error, Result};
use crate::instance::Instance;

/// VNC/SPICE client handoff and display authentication.
///
/// QEMU can adopt an already-accepted client connection: the socket's file
/// descriptor travels over the control channel in an `SCM_RIGHTS` message
/// (`getfd`), then `add_client` binds it to the display protocol. The caller
/// keeps ownership of its descriptor; the duplicate made for the transfer is
/// closed once QEMU has it.
impl Instance {
    /// Hands an accepted client socket to QEMU's VNC server. With
    /// `skip_auth`, the client bypasses VNC authentication.
    pub fn add_vnc_client(&self, client: &impl AsRawFd, skip_auth: bool) -> Result<()> {
        self.add_client_fd("vnc", client.as_raw_fd(), skip_auth)
    }

    /// Hands an accepted client socket to QEMU's SPICE server.
    pub fn add_spice_client(&self, client: &impl AsRawFd, skip_auth: bool) -> Result<()> {
        self.add_client_fd("spice", client.as_raw_fd(), skip_auth)
    }

    fn add_client_fd(&self, protocol: &str, fd: RawFd, skip_auth: bool) -> Result<()> {
        let qmp = self.transport()?;
        let dup = dup_fd(fd)?;
        let fd_name = client_fd_name(protocol);

        let outcome = qmp
            .execute_with_fd("getfd", Some(json!({ "fdname": fd_name })), dup)
            .and_then(|_| {
                qmp.execute(
                    "add_client",
                    Some(json!({
                        "protocol": protocol,
                        "fdname": fd_name,
                        "skipauth": skip_auth,
                        "tls": false,
                    })),
                )
            });
        close_fd(dup);
        outcome.map(|_| ())
    }

    pub fn set_vnc_password(&self, password: &str) -> Result<()> {
        self.set_password("vnc", password)
    }

    pub fn set_spice_password(&self, password: &str) -> Result<()> {
        self.set_password("spice", password)
    }

    fn set_password(&self, protocol: &str, password: &str) -> Result<()> {
        self.transport()?
            .execute(
                "set_password",
                Some(json!({ "protocol": protocol, "password": password })),
            )
            .map(|_| ())
    }

    /// Expires the VNC password; `now` expires immediately, `never` keeps it
    /// valid.
    pub fn expire_vnc_password(&self, expire_time: &str) -> Result<()> {
        self.expire_password("vnc", expire_time)
    }

    pub fn expire_spice_password(&self, expire_time: &str) -> Result<()> {
        self.expire_password("spice", expire_time)
    }

    fn expire_password(&self, protocol: &str, expire_time: &str) -> Result<()> {
        self.transport()?
            .execute(
                "expire_password",
                Some(json!({ "protocol": protocol, "time": expire_time })),
            )
            .map(|_| ())
    }
}

fn client_fd_name(protocol: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    format!("{protocol}-client-{nanos}")
}

fn dup_fd(fd: RawFd) -> Result<RawFd> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(Error::os(format!(
            "failed to duplicate client descriptor: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(dup)
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_names_are_protocol_scoped_and_unique() {
        let first = client_fd_name("vnc");
        let second = client_fd_name("vnc");
        assert!(first.starts_with("vnc-client-"));
        assert_ne!(first, second);
        assert!(client_fd_name("spice").starts_with("spice-client-"));
    }

    #[test]
    fn dup_produces_an_independent_descriptor() {
        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let dup = dup_fd(left.as_raw_fd()).expect("dup succeeds");
        assert_ne!(dup, left.as_raw_fd());
        close_fd(dup);
        // The original descriptor must still be usable.
        assert!(left.peer_addr().is_ok());
    }
}
