use std::time::Duration;

use futures_util::StreamExt;
use nyamodbus::Frame;
use nyamodbus_codec::RtuCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{trace, warn};

/// Checks per quiet period for line silence
const SILENCE_CHECKS: u32 = 4;

/// Decodes frames off the line until the stream ends.
///
/// Frames without a length lookahead are completed once no byte has arrived for `quiet`.
/// Arrival is sampled every `quiet / SILENCE_CHECKS`, so a frame is never cut short and
/// is reported at most one sample late.
pub async fn sniff<T>(
    mut frames: Framed<T, RtuCodec>,
    quiet: Duration,
    mut report: impl FnMut(&Frame),
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let sample = quiet / SILENCE_CHECKS;
    let mut seen = 0;
    let mut last_input = Instant::now();

    loop {
        match timeout(sample, frames.next()).await {
            Ok(Some(Ok(frame))) => {
                report(&frame);
                seen = 0;
                last_input = Instant::now();
            }
            Ok(Some(Err(err))) => {
                warn!("Dropping frame: {}", err);
                // a decode error ends the stream, start over on the same port
                frames = Framed::from_parts(frames.into_parts());
                seen = 0;
            }
            Ok(None) => break,
            Err(_) => {
                let now = Instant::now();
                let added = frames.codec().parser().buffer().added();
                if added != seen {
                    seen = added;
                    last_input = now;
                } else if added > 0 && now.duration_since(last_input) >= quiet {
                    trace!("Line quiet with {} bytes buffered", added);
                    match frames.codec_mut().flush() {
                        Ok(Some(frame)) => report(&frame),
                        Ok(None) => {}
                        Err(err) => warn!("Dropping frame: {}", err),
                    }
                    seen = 0;
                }
            }
        }
    }
}
