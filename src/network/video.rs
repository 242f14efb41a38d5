//! Video port: one viewer at a time, length-prefixed JPEG frames.
//!
//! Wire format per frame: `[u32 little-endian length][JPEG bytes]`.

use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

use super::listener::ListenerSocket;
use crate::{
    config::VideoConfig,
    error::ServerError,
    hardware::Camera,
    utils::metrics::ServerMetrics,
};

const UNBOUND_WAIT: Duration = Duration::from_millis(100);
/// Frame writes that stall longer than this count as a disconnect.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(jpeg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame larger than 4 GiB"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(jpeg)?;
    out.flush()
}

struct Viewer {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Viewer {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
            debug!("[VIDEO] {addr}: write timeout not set: {e}");
        }
        stream.set_nodelay(true).ok();
        Self { stream, addr }
    }

    fn close(self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

pub struct VideoStreamer {
    listener: Arc<ListenerSocket>,
    camera: Arc<dyn Camera>,
    metrics: Arc<ServerMetrics>,
    config: VideoConfig,
    running: Arc<AtomicBool>,
    accept_timeout: Duration,
    sleeper: SpinSleeper,
}

impl VideoStreamer {
    pub fn new(
        listener: Arc<ListenerSocket>,
        camera: Arc<dyn Camera>,
        metrics: Arc<ServerMetrics>,
        config: VideoConfig,
        running: Arc<AtomicBool>,
        accept_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            camera,
            metrics,
            config,
            running,
            accept_timeout,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, ServerError> {
        thread::Builder::new()
            .name("video".into())
            .spawn(move || self.run())
            .map_err(|source| ServerError::Spawn { name: "video", source })
    }

    fn run(self) {
        info!("[VIDEO] streamer started");
        let mut viewer: Option<Viewer> = None;
        while self.running.load(Ordering::Acquire) {
            viewer = match viewer.take() {
                None => self.wait_for_viewer(),
                Some(current) => self.serve_frame(current),
            };
        }
        if let Some(v) = viewer {
            self.release(v);
        }
        info!("[VIDEO] streamer stopped");
    }

    fn wait_for_viewer(&self) -> Option<Viewer> {
        match self.listener.accept_timeout(self.accept_timeout) {
            Ok(Some((stream, addr))) => self.start_viewer(stream, addr),
            Ok(None) => None,
            Err(ServerError::NotBound) => {
                thread::sleep(UNBOUND_WAIT);
                None
            }
            Err(e) => {
                warn!("[VIDEO] {e}");
                None
            }
        }
    }

    fn start_viewer(&self, stream: TcpStream, addr: SocketAddr) -> Option<Viewer> {
        info!("[VIDEO] viewer connected: {addr}");
        if let Err(e) = self.camera.start() {
            warn!("[VIDEO] {e}");
            self.metrics.record_camera_failure();
            stream.shutdown(Shutdown::Both).ok();
            return None;
        }
        self.metrics.set_video_connected(true);
        Some(Viewer::new(stream, addr))
    }

    /// Sends one frame to `viewer`; returns the viewer to keep streaming to.
    fn serve_frame(&self, mut viewer: Viewer) -> Option<Viewer> {
        // A newcomer replaces the current viewer; the camera keeps running.
        match self.listener.try_accept() {
            Ok(Some((stream, addr))) => {
                info!("[VIDEO] viewer {addr} replaces {}", viewer.addr);
                viewer.close();
                viewer = Viewer::new(stream, addr);
            }
            Ok(None) | Err(ServerError::NotBound) => {}
            Err(e) => debug!("[VIDEO] {e}"),
        }

        let started = Instant::now();
        let frame = match self.camera.capture_jpeg() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[VIDEO] {e}");
                self.metrics.record_camera_failure();
                self.release(viewer);
                return None;
            }
        };
        if let Err(e) = write_frame(&mut viewer.stream, &frame) {
            info!("[VIDEO] viewer {} disconnected: {e}", viewer.addr);
            self.metrics.record_video_disconnect();
            self.release(viewer);
            return None;
        }
        self.metrics.record_frame();

        let spent = started.elapsed();
        let interval = self.config.frame_interval();
        if spent < interval {
            self.sleeper.sleep(interval - spent);
        }
        Some(viewer)
    }

    fn release(&self, viewer: Viewer) {
        self.camera.stop();
        self.metrics.set_video_connected(false);
        viewer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_little_endian_length_prefix() {
        let mut out = Vec::new();
        write_frame(&mut out, &[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        assert_eq!(&out[..4], &[4, 0, 0, 0]);
        assert_eq!(&out[4..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn write_failure_surfaces() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        assert!(write_frame(&mut Broken, b"jpeg").is_err());
    }
}
