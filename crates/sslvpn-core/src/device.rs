//! TUN device creation.
//!
//! Devices are created bare: addressing, MTU and link state are applied
//! afterwards with `ip` commands by [`crate::link::LinkManager`], so the same
//! code path configures the real kernel device and the in-memory devices used
//! in tests.

use crate::error::{GatewayError, GatewayResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// An open TUN device that can be split into independent halves.
///
/// Dropping both halves closes the device.
pub trait TunDevice: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Kernel-assigned interface name (e.g., "tun0").
    fn name(&self) -> &str;

    /// Split into read and write halves.
    fn split(self) -> GatewayResult<(Self::Reader, Self::Writer)>;
}

/// Opens TUN devices.
pub trait TunProvider: Send + Sync + 'static {
    type Device: TunDevice;

    fn open(&self) -> GatewayResult<Self::Device>;
}

/// [`TunProvider`] backed by the kernel's `/dev/net/tun`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelTun;

impl TunProvider for KernelTun {
    type Device = KernelDevice;

    fn open(&self) -> GatewayResult<KernelDevice> {
        let mut tun_config = Configuration::default();

        // Platform-specific configuration
        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            GatewayError::tun_device_with_source("Failed to create TUN device", e)
        })?;

        let name = device
            .tun_name()
            .map_err(|e| GatewayError::tun_device_with_source("Failed to get TUN name", e))?;

        log::debug!("Opened TUN device {}", name);

        Ok(KernelDevice { device, name })
    }
}

/// A kernel TUN device with async I/O.
pub struct KernelDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice for KernelDevice {
    type Reader = DeviceReader;
    type Writer = DeviceWriter;

    fn name(&self) -> &str {
        &self.name
    }

    /// Note: the tun crate returns (writer, reader) order from split().
    fn split(self) -> GatewayResult<(DeviceReader, DeviceWriter)> {
        let (writer, reader) = self.device.split().map_err(|e| {
            GatewayError::tun_device_with_source(format!("Failed to split {}", self.name), e)
        })?;
        Ok((reader, writer))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory TUN devices.

    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;

    /// Read half fed packet-by-packet from a channel.
    ///
    /// A dropped sender reads as end-of-file.
    pub struct MockReader {
        rx: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    }

    impl AsyncRead for MockReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(packet))) => {
                    let n = packet.len().min(buf.remaining());
                    buf.put_slice(&packet[..n]);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        }
    }

    /// Write half recording every packet written.
    pub struct MockWriter {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: Arc<AtomicBool>,
    }

    impl AsyncWrite for MockWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device gone",
                )));
            }
            self.written.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Test-side controls of a [`MockDevice`].
    #[derive(Clone)]
    pub struct DeviceControl {
        pub packets: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail_writes: Arc<AtomicBool>,
        pub dropped: Arc<AtomicUsize>,
    }

    impl DeviceControl {
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    pub struct MockDevice {
        name: String,
        reader: Option<MockReader>,
        writer: Option<MockWriter>,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for MockDevice {
        fn drop(&mut self) {
            // Split devices hand their halves to the loops; only count
            // devices released before linking.
            if self.reader.is_some() {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl TunDevice for MockDevice {
        type Reader = MockReader;
        type Writer = MockWriter;

        fn name(&self) -> &str {
            &self.name
        }

        fn split(mut self) -> GatewayResult<(MockReader, MockWriter)> {
            match (self.reader.take(), self.writer.take()) {
                (Some(reader), Some(writer)) => Ok((reader, writer)),
                _ => Err(GatewayError::tun_device("device already split")),
            }
        }
    }

    /// Hands out one pre-built device per `open`.
    pub struct MockProvider {
        name: String,
        staged: Mutex<Vec<MockDevice>>,
    }

    impl MockProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                staged: Mutex::new(Vec::new()),
            }
        }

        /// Stage a device and return its controls.
        pub fn stage(&self) -> DeviceControl {
            let (packets, rx) = mpsc::unbounded_channel();
            let control = DeviceControl {
                packets,
                written: Arc::new(Mutex::new(Vec::new())),
                fail_writes: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicUsize::new(0)),
            };
            self.staged.lock().unwrap().push(MockDevice {
                name: self.name.clone(),
                reader: Some(MockReader { rx }),
                writer: Some(MockWriter {
                    written: control.written.clone(),
                    fail: control.fail_writes.clone(),
                }),
                dropped: control.dropped.clone(),
            });
            control
        }
    }

    impl TunProvider for MockProvider {
        type Device = MockDevice;

        fn open(&self) -> GatewayResult<MockDevice> {
            self.staged
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| GatewayError::tun_device("no TUN device available"))
        }
    }
}
