use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppState, camera::FrameReceiver};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub async fn video_feed(State(state): State<AppState>) -> Response {
    debug!("video viewer connected");
    let frames = multipart_frames(state.frames.clone(), state.shutdown.child_token());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], Body::from_stream(frames)).into_response()
}

/// One multipart part per new frame, starting with the current one.
///
/// Ends when the capture thread goes away or `token` is cancelled.
pub fn multipart_frames(
    mut frames: FrameReceiver,
    token: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    frames.mark_changed();

    stream::unfold((frames, token), |(mut frames, token)| async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return None,
                changed = frames.changed() => changed.ok()?,
            }

            let frame = frames.borrow_and_update().clone();
            if let Some(frame) = frame {
                return Some((Ok(multipart_part(&frame)), (frames, token)));
            }
        }
    })
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 64);
    part.put_slice(b"--");
    part.put_slice(BOUNDARY.as_bytes());
    part.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}
