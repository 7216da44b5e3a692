//! Ancillary file-descriptor passing over a socketpair.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

#[repr(align(8))]
struct CmsgBuffer([u8; 64]);

/// Send `fd` over `socket` as a single `SCM_RIGHTS` message carrying
/// one data byte.
pub(crate) fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let byte = [0u8; 1];

    unsafe {
        let mut iov = libc::iovec {
            iov_base: byte.as_ptr() as *mut libc::c_void,
            iov_len: 1,
        };
        let mut cmsg_buf = CmsgBuffer([0; 64]);

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            &fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );

        loop {
            let sent = libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL);
            if sent >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Receive one fd from `socket`. `Ok(None)` on EOF; a message without
/// exactly one fd is an error.
pub fn receive_fd(socket: RawFd) -> io::Result<Option<RawFd>> {
    let mut byte = [0u8; 1];

    unsafe {
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr() as *mut libc::c_void,
            iov_len: 1,
        };
        let mut cmsg_buf = CmsgBuffer([0; 64]);

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let received = loop {
            let received = libc::recvmsg(socket, &mut msg, 0);
            if received >= 0 {
                break received;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if received == 0 {
            return Ok(None);
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            || (*cmsg).cmsg_len != libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as libc::size_t
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message contains no file descriptor",
            ));
        }

        let mut fd: RawFd = -1;
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            &mut fd as *mut RawFd as *mut u8,
            mem::size_of::<RawFd>(),
        );
        Ok(Some(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn roundtrip_fd() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload").unwrap();
        file.flush().unwrap();

        send_fd(a.as_raw_fd(), file.as_raw_fd()).unwrap();

        let fd = receive_fd(b.as_raw_fd()).unwrap().unwrap();
        let mut received = unsafe { std::fs::File::from_raw_fd(fd) };
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload");
    }

    #[test]
    fn eof_is_none() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(receive_fd(b.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn plain_bytes_are_an_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();
        assert!(receive_fd(b.as_raw_fd()).is_err());
    }
}
