//! Line-framed pipe IO for the worker process.
//!
//! The writer drains a queue of encoded requests into the worker's stdin;
//! the reader splits stdout into lines and decodes each one into a
//! [`WorkerFrame`]. Bad lines never stop the reader.

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::ipc_types::{decode_frame, WorkerFrame};

/// Task that writes queued request lines to the worker's stdin.
pub async fn stdin_writer_task<W>(mut cmd_rx: mpsc::UnboundedReceiver<String>, mut stdin: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(json_line) = cmd_rx.recv().await {
        if let Err(e) = stdin.write_all(format!("{json_line}\n").as_bytes()).await {
            error!("[BRIDGE] Failed to write to worker stdin: {e}");
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("[BRIDGE] Failed to flush worker stdin: {e}");
            break;
        }
    }
    debug!("[BRIDGE] Stdin writer task exiting");
}

/// Read frames until EOF, handing each decoded frame to `on_frame`.
///
/// Returns the number of frames delivered.
pub async fn read_frames<R, F>(stdout: R, mut on_frame: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(WorkerFrame),
{
    let mut lines = BufReader::new(stdout).lines();
    let mut delivered = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame(&line) {
                    Ok(frame) => {
                        delivered += 1;
                        on_frame(frame);
                    }
                    Err(e) => warn!("[BRIDGE] Skipping worker line ({e}): {line}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("[BRIDGE] Worker stdout read error: {e}");
                break;
            }
        }
    }

    debug!("[BRIDGE] Stdout reader exiting after {delivered} frames");
    delivered
}

/// Relay the worker's stderr into our log.
pub async fn stderr_log_task<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            info!("[WORKER] {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let input: &[u8] = b"not json\n\n{\"type\":\"ready\"}\n{\"type\":\"response\",\"id\":1,\"message\":\"{}\"}\n";
        let mut frames = Vec::new();

        let delivered = read_frames(input, |frame| frames.push(frame)).await;

        assert_eq!(delivered, 2);
        assert_eq!(frames[0], WorkerFrame::Ready { message: None });
        assert_eq!(
            frames[1],
            WorkerFrame::Response {
                id: 1,
                message: "{}".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_read() {
        let input: &[u8] = b"{\"type\":\"error\",\"message\":\"boom\"}";
        let mut frames = Vec::new();
        read_frames(input, |frame| frames.push(frame)).await;
        assert_eq!(
            frames,
            vec![WorkerFrame::Error {
                message: Some("boom".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_writer_appends_newline_per_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(stdin_writer_task(rx, client));

        tx.send(r#"{"id":1,"audioPath":"a.wav"}"#.to_string()).unwrap();
        tx.send(r#"{"id":2,"audioPath":"b.wav"}"#.to_string()).unwrap();
        drop(tx);
        writer.await.unwrap();

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"audioPath\":\"a.wav\"}\n{\"id\":2,\"audioPath\":\"b.wav\"}\n"
        );
    }
}
