//! Network device seam
//!
//! The stack touches hardware only through the `FrameDevice` trait: one
//! Ethernet frame per read/write. `TapDevice` implements it over a Linux
//! tap interface; `LoopDevice` is the in-memory double used by tests.

use std::collections::VecDeque;
use std::ffi::CString;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::{NetworkError, NetworkResult};

/// Poll interval for the blocking read so the receive loop can observe
/// shutdown between frames.
const READ_POLL_MS: i32 = 100;

/// A device that exchanges whole Ethernet frames.
pub trait FrameDevice: Send + Sync {
    /// Read one frame into `buf`. Returns `WouldBlock` if no frame arrived
    /// within the poll interval, letting the caller check for shutdown.
    fn read_frame(&self, buf: &mut [u8]) -> NetworkResult<usize>;

    /// Write one frame; blocks until the device accepts it.
    fn write_frame(&self, frame: &[u8]) -> NetworkResult<usize>;

    /// Device MTU (IP payload bound, excluding the Ethernet header).
    fn mtu(&self) -> usize;
}

/// Linux tap device (`/dev/net/tun` with `IFF_TAP | IFF_NO_PI`).
pub struct TapDevice {
    fd: libc::c_int,
    name: String,
    mtu: usize,
}

impl TapDevice {
    /// Open the tap interface `name`, which must already exist and be up.
    pub fn open(name: &str, mtu: usize) -> NetworkResult<Self> {
        let path = CString::new("/dev/net/tun").map_err(|_| NetworkError::HardwareError)?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(NetworkError::HardwareError);
        }

        #[repr(C)]
        struct IfReq {
            ifr_name: [u8; libc::IF_NAMESIZE],
            ifr_flags: libc::c_short,
            _pad: [u8; 22],
        }

        let mut req = IfReq {
            ifr_name: [0; libc::IF_NAMESIZE],
            ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= libc::IF_NAMESIZE {
            unsafe { libc::close(fd) };
            return Err(NetworkError::InvalidArgument);
        }
        req.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);

        const TUNSETIFF: libc::c_ulong = 0x400454ca;
        let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut IfReq) };
        if rc < 0 {
            unsafe { libc::close(fd) };
            return Err(NetworkError::HardwareError);
        }

        log::info!(target: "stack", "Attached to tap device {}", name);
        Ok(TapDevice {
            fd,
            name: name.to_string(),
            mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FrameDevice for TapDevice {
    fn read_frame(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MS) };
        if ready < 0 {
            return Err(NetworkError::HardwareError);
        }
        if ready == 0 {
            return Err(NetworkError::WouldBlock);
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(NetworkError::HardwareError);
        }
        Ok(n as usize)
    }

    fn write_frame(&self, frame: &[u8]) -> NetworkResult<usize> {
        let n =
            unsafe { libc::write(self.fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
        if n < 0 {
            return Err(NetworkError::HardwareError);
        }
        Ok(n as usize)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// In-memory device double: frames "received from the wire" are injected
/// into an inbound queue, written frames are captured for inspection.
pub struct LoopDevice {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Condvar,
    outbound: Mutex<Vec<Vec<u8>>>,
    mtu: usize,
}

impl LoopDevice {
    pub fn new(mtu: usize) -> Self {
        LoopDevice {
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            outbound: Mutex::new(Vec::new()),
            mtu,
        }
    }

    /// Inject a frame as if it arrived from the wire.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(frame);
        self.inbound_ready.notify_one();
    }

    /// Frames the stack has written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().unwrap().clone()
    }
}

impl FrameDevice for LoopDevice {
    fn read_frame(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        let mut queue = self.inbound.lock().unwrap();
        if queue.is_empty() {
            let (woken, _) = self
                .inbound_ready
                .wait_timeout(queue, Duration::from_millis(READ_POLL_MS as u64))
                .unwrap();
            queue = woken;
        }
        match queue.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Err(NetworkError::WouldBlock),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> NetworkResult<usize> {
        self.outbound.lock().unwrap().push(frame.to_vec());
        Ok(frame.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_device_round_trip() {
        let dev = LoopDevice::new(1500);
        dev.inject(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2048];
        let n = dev.read_frame(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        dev.write_frame(&[9, 8, 7]).unwrap();
        assert_eq!(dev.written(), vec![vec![9, 8, 7]]);
    }

    #[test]
    fn loop_device_read_times_out_when_idle() {
        let dev = LoopDevice::new(1500);
        let mut buf = [0u8; 64];
        assert_eq!(dev.read_frame(&mut buf), Err(NetworkError::WouldBlock));
    }
}
