//! The subset of the git smart-HTTP protocol (v1) used to fetch a pack.
//!
//! References:
//! - gitprotocol-common(5) <https://git-scm.com/docs/gitprotocol-common>
//! - gitprotocol-pack(5) <https://git-scm.com/docs/gitprotocol-pack>
//!
//! The negotiation is two round-trips: GET the ref advertisement, then
//! POST a want/have/done body and read the pack off the side-band-64k
//! multiplexed response.

use anyhow::{bail, ensure, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::io;
use std::io::prelude::*;
use std::io::Cursor;
use std::str;

use crate::pkt_line;

const UPLOAD_PACK_CAPS: &str = "multi_ack_detailed no-done side-band-64k thin-pack ofs-delta";

fn io_err_invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reader for one logical channel of a side-band-64k stream.
///
/// The upstream multiplexes frames of the form
/// `<4 hex length><stream id byte><payload>`: id 1 carries the packfile,
/// id 2 progress text (discarded), id 3 a fatal server message (surfaced
/// as an error). A flush-pkt ends the stream.
pub struct SideBandReader<R> {
    src: R,
    /// Remaining payload bytes of the current id-1 frame.
    rem: usize,
    done: bool,
}

impl<R: Read> SideBandReader<R> {
    pub fn new(src: R) -> Self {
        SideBandReader {
            src,
            rem: 0,
            done: false,
        }
    }

    /// Read the next frame header. Returns the payload length of an id-1
    /// frame, or `None` when the stream is over (flush-pkt, or a server
    /// that just closes the connection). Progress frames are skipped here.
    fn next_data_frame(&mut self) -> io::Result<Option<usize>> {
        loop {
            let mut head = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                let n = self.src.read(&mut head[got..])?;
                if n == 0 {
                    if got == 0 {
                        return Ok(None);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated pkt-line length",
                    ));
                }
                got += n;
            }

            let Some(len) = pkt_line::decode_len(&head)? else {
                return Ok(None);
            };
            if len == 0 {
                return Err(io_err_invalid("pkt-line frame has no stream id"));
            }

            let mut id = [0u8; 1];
            self.src.read_exact(&mut id)?;
            let payload = len - 1;
            match id[0] {
                1 => return Ok(Some(payload)),
                2 => {
                    // progress text, dropped
                    io::copy(&mut (&mut self.src).take(payload as u64), &mut io::sink())?;
                }
                3 => {
                    let mut msg = Vec::new();
                    (&mut self.src)
                        .take(payload.min(1024) as u64)
                        .read_to_end(&mut msg)?;
                    let msg = String::from_utf8_lossy(&msg);
                    return Err(io::Error::other(format!(
                        "remote error: {}",
                        msg.trim_end()
                    )));
                }
                other => {
                    return Err(io_err_invalid(&format!(
                        "unexpected side-band stream id: {}",
                        other
                    )))
                }
            }
        }
    }
}

impl<R: Read> Read for SideBandReader<R> {
    /// Deliver the concatenated id-1 payloads, filling `buf` across frame
    /// boundaries until the flush-pkt.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.rem > 0 {
                let want = self.rem.min(buf.len() - filled);
                let n = self.src.read(&mut buf[filled..filled + want])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated side-band frame",
                    ));
                }
                filled += n;
                self.rem -= n;
                continue;
            }
            if self.done {
                break;
            }
            match self.next_data_frame()? {
                Some(len) => self.rem = len,
                None => self.done = true,
            }
        }
        Ok(filled)
    }
}

/// Parse the ref advertisement and return the ids to request, currently
/// just the first advertised ref.
fn parse_advertisement(data: &[u8]) -> Result<Vec<String>> {
    let mut cur = Cursor::new(data);

    let first = pkt_line::read_pkt_line(&mut cur)
        .context("reading service line")?
        .context("advertisement starts with a flush")?;
    let first = strip_newline(&first);
    ensure!(
        first == b"# service=git-upload-pack",
        "unexpected service line: {:?}",
        String::from_utf8_lossy(first)
    );
    ensure!(
        pkt_line::read_pkt_line(&mut cur)
            .context("reading advertisement")?
            .is_none(),
        "expected flush after service line"
    );

    let line = pkt_line::read_pkt_line(&mut cur)
        .context("reading first ref")?
        .context("remote advertised no refs")?;
    // <oid> <name>\0<capability list>, capabilities only on the first ref
    let line = match line.iter().position(|&b| b == 0) {
        Some(nul) => &line[..nul],
        None => &line[..],
    };
    let oid = line
        .split(|&b| b == b' ')
        .next()
        .context("empty ref line")?;
    ensure!(
        oid.len() == 40 && oid.iter().all(u8::is_ascii_hexdigit),
        "malformed object id in ref advertisement"
    );
    Ok(vec![str::from_utf8(oid).expect("checked hex is ASCII").to_string()])
}

/// Build the upload-pack request body: wants (capabilities on the first),
/// flush, haves, done.
fn build_request(wants: &[String], haves: &[String], user_agent: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, oid) in wants.iter().enumerate() {
        let line = if i == 0 {
            format!("want {oid} {UPLOAD_PACK_CAPS} agent={user_agent}\n")
        } else {
            format!("want {oid}\n")
        };
        pkt_line::write_pkt_line(&mut body, Some(line.as_bytes()));
    }
    pkt_line::write_pkt_line(&mut body, None);
    for oid in haves {
        pkt_line::write_pkt_line(&mut body, Some(format!("have {oid}\n").as_bytes()));
    }
    pkt_line::write_pkt_line(&mut body, Some(b"done\n"));
    body
}

/// Consume the ACK/NAK lines that precede the pack data.
///
/// With multi_ack_detailed the server sends any number of
/// `ACK <oid> <status>` lines; a bare `NAK` or a two-token `ACK <oid>`
/// ends the preamble.
fn read_ack_preamble(src: &mut impl Read) -> Result<()> {
    loop {
        let line = pkt_line::read_pkt_line(src)
            .context("reading negotiation reply")?
            .context("unexpected flush in negotiation reply")?;
        let line = strip_newline(&line);
        let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
        match tokens.as_slice() {
            [b"NAK"] => return Ok(()),
            [b"ACK", _] => return Ok(()),
            [b"ACK", _, _] => continue,
            _ => bail!(
                "unexpected negotiation reply: {:?}",
                String::from_utf8_lossy(line)
            ),
        }
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

/// Negotiate a fetch of the first advertised ref and return a reader over
/// the raw pack bytes. `haves` are object ids the server may assume we
/// already store, shrinking the pack it builds.
pub fn fetch_pack(
    client: &Client,
    owner: &str,
    repo: &str,
    haves: &[String],
    user_agent: &str,
) -> Result<SideBandReader<Response>> {
    print!("Starting pack negotiation... ");
    let _ = io::stdout().flush();

    let url = format!("https://github.com/{owner}/{repo}.git/info/refs?service=git-upload-pack");
    let resp = client
        .get(&url)
        .send()
        .context("requesting ref advertisement")?;
    ensure!(
        resp.status().is_success(),
        "ref advertisement request failed: {}",
        resp.status()
    );
    let body = resp.bytes().context("reading ref advertisement")?;
    let wants = parse_advertisement(&body).context("parsing ref advertisement")?;

    let url = format!("https://github.com/{owner}/{repo}.git/git-upload-pack");
    let mut resp = client
        .post(&url)
        .header(CONTENT_TYPE, "application/x-git-upload-pack-request")
        .header(ACCEPT, "application/x-git-upload-pack-result")
        .body(build_request(&wants, haves, user_agent))
        .send()
        .context("requesting pack")?;
    ensure!(
        resp.status().is_success(),
        "upload-pack request failed: {}",
        resp.status()
    );
    read_ack_preamble(&mut resp).context("reading negotiation reply")?;
    println!("Done.");

    Ok(SideBandReader::new(resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_band_interleave() {
        // id-1 "abcd", id-2 progress (dropped), id-1 "ef", flush
        let mut stream = Vec::new();
        stream.extend_from_slice(b"0009\x01abcd");
        stream.extend_from_slice(b"000d\x02progress");
        stream.extend_from_slice(b"0007\x01ef");
        stream.extend_from_slice(b"0000");

        let mut reader = SideBandReader::new(Cursor::new(stream));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(reader.read(&mut [0; 8]).unwrap(), 0);
    }

    #[test]
    fn partial_reads_cross_frame_boundaries() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"0008\x01abc");
        stream.extend_from_slice(b"0008\x01def");
        stream.extend_from_slice(b"0000");

        let mut reader = SideBandReader::new(Cursor::new(stream));
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ef");
    }

    #[test]
    fn error_stream_surfaces() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"0009\x03boom");
        let mut reader = SideBandReader::new(Cursor::new(stream));
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn eof_without_flush_is_end_of_stream() {
        let mut reader = SideBandReader::new(Cursor::new(b"0007\x01hi".to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hi");
    }

    #[test]
    fn advertisement_takes_first_ref() {
        let mut adv = Vec::new();
        pkt_line::write_pkt_line(&mut adv, Some(b"# service=git-upload-pack\n"));
        pkt_line::write_pkt_line(&mut adv, None);
        let oid = "c4f3".repeat(10);
        let line = format!("{oid} HEAD\0multi_ack thin-pack side-band-64k agent=git/2\n");
        pkt_line::write_pkt_line(&mut adv, Some(line.as_bytes()));
        let other = format!("{} refs/heads/dev\n", "ab".repeat(20));
        pkt_line::write_pkt_line(&mut adv, Some(other.as_bytes()));
        pkt_line::write_pkt_line(&mut adv, None);

        assert_eq!(parse_advertisement(&adv).unwrap(), vec![oid]);
    }

    #[test]
    fn advertisement_without_refs_fails() {
        let mut adv = Vec::new();
        pkt_line::write_pkt_line(&mut adv, Some(b"# service=git-upload-pack\n"));
        pkt_line::write_pkt_line(&mut adv, None);
        pkt_line::write_pkt_line(&mut adv, None);
        assert!(parse_advertisement(&adv).is_err());
    }

    #[test]
    fn request_body_layout() {
        let wants = vec!["a".repeat(40)];
        let haves = vec!["b".repeat(40), "c".repeat(40)];
        let body = build_request(&wants, &haves, "packrat/0.1.0");

        let mut cur = Cursor::new(body);
        let first = pkt_line::read_pkt_line(&mut cur).unwrap().unwrap();
        let first = String::from_utf8(first).unwrap();
        assert!(first.starts_with(&format!("want {}", "a".repeat(40))));
        assert!(first.contains("side-band-64k"));
        assert!(first.contains("ofs-delta"));
        assert!(first.contains("agent=packrat/0.1.0"));
        assert_eq!(pkt_line::read_pkt_line(&mut cur).unwrap(), None);
        let have1 = pkt_line::read_pkt_line(&mut cur).unwrap().unwrap();
        assert_eq!(have1, format!("have {}\n", "b".repeat(40)).into_bytes());
        let have2 = pkt_line::read_pkt_line(&mut cur).unwrap().unwrap();
        assert_eq!(have2, format!("have {}\n", "c".repeat(40)).into_bytes());
        assert_eq!(
            pkt_line::read_pkt_line(&mut cur).unwrap().unwrap(),
            b"done\n"
        );
    }

    #[test]
    fn ack_preamble_variants() {
        let mut body = Vec::new();
        let oid = "d".repeat(40);
        pkt_line::write_pkt_line(&mut body, Some(format!("ACK {oid} common\n").as_bytes()));
        pkt_line::write_pkt_line(&mut body, Some(format!("ACK {oid} ready\n").as_bytes()));
        pkt_line::write_pkt_line(&mut body, Some(format!("ACK {oid}\n").as_bytes()));
        body.extend_from_slice(b"rest");
        let mut cur = Cursor::new(body);
        read_ack_preamble(&mut cur).unwrap();
        let mut rest = Vec::new();
        cur.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");

        let mut body = Vec::new();
        pkt_line::write_pkt_line(&mut body, Some(b"NAK\n"));
        read_ack_preamble(&mut Cursor::new(body)).unwrap();

        let mut body = Vec::new();
        pkt_line::write_pkt_line(&mut body, Some(b"ERR denied\n"));
        assert!(read_ack_preamble(&mut Cursor::new(body)).is_err());
    }
}
