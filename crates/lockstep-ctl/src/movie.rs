//! Movie files: the input sequence of a run plus the settings it needs.
//!
//! A movie replays identically only into a process started with the same
//! framerate, initial time and seed, so those travel with the inputs.

use std::fs::File;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::Path;

use lockstep_protocol::InputVector;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::client::{ClientError, ControllerClient, FrameAck};

pub const MOVIE_VERSION: u32 = 1;

#[derive(Debug, Snafu)]
pub enum MovieError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },

    #[snafu(display("movie format version {version} is not supported"))]
    Version { version: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub version: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub initial_time_ns: u64,
    pub seed: u64,
    /// Identity of the executable the movie was recorded against.
    #[serde(default)]
    pub identity: Option<u64>,
    pub frames: Vec<InputVector>,
}

impl Default for Movie {
    fn default() -> Self {
        Self {
            version: MOVIE_VERSION,
            fps_num: 60,
            fps_den: 1,
            initial_time_ns: 1_000_000_000,
            seed: 0,
            identity: None,
            frames: Vec::new(),
        }
    }
}

impl Movie {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, inputs: InputVector) {
        self.frames.push(inputs);
    }

    /// Drop every frame from `frame` on, for re-recording after a load.
    pub fn truncate(&mut self, frame: usize) {
        self.frames.truncate(frame);
    }

    pub fn load(path: &Path) -> Result<Self, MovieError> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, MovieError> {
        let movie: Movie = serde_json::from_str(text)?;
        if movie.version != MOVIE_VERSION {
            return VersionSnafu { version: movie.version }.fail();
        }
        Ok(movie)
    }

    pub fn save(&self, path: &Path) -> Result<(), MovieError> {
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Environment the target must be started with to replay this movie.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        vec![
            ("LOCKSTEP_FPS_NUM", self.fps_num.to_string()),
            ("LOCKSTEP_FPS_DEN", self.fps_den.to_string()),
            ("LOCKSTEP_INITIAL_TIME_NS", self.initial_time_ns.to_string()),
            ("LOCKSTEP_SEED", self.seed.to_string()),
        ]
    }

    /// Feed `frames` of the movie to the session, one `FrameAdvance` each.
    /// Returns the last acknowledgement.
    pub fn play<S: Read + Write>(
        &self,
        client: &mut ControllerClient<S>,
        frames: Range<usize>,
    ) -> Result<Option<FrameAck>, ClientError> {
        let end = frames.end.min(self.frames.len());
        let mut last = None;
        for inputs in &self.frames[frames.start.min(end)..end] {
            last = Some(client.advance(inputs)?);
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Movie {
        let mut m = Movie {
            seed: 11,
            identity: Some(0xABC),
            ..Movie::default()
        };
        for key in [0x61, 0, 0x62] {
            let mut v = InputVector::default();
            v.press_key(key);
            m.push(v);
        }
        m
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join(format!("lockstep-movie-{}.json", std::process::id()));
        let m = sample();
        m.save(&path).unwrap();
        let back = Movie::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, m);
        assert!(back.frames[0].is_key_down(0x61));
        assert!(back.frames[1].is_released());
    }

    #[test]
    fn identity_is_optional() {
        let mut json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        json.as_object_mut().unwrap().remove("identity");
        let m = Movie::from_json(&json.to_string()).unwrap();
        assert_eq!(m.identity, None);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut m = sample();
        m.version = 99;
        let text = serde_json::to_string(&m).unwrap();
        assert!(matches!(Movie::from_json(&text), Err(MovieError::Version { version: 99 })));
    }

    #[test]
    fn environment_matches_settings() {
        let env = sample().environment();
        assert!(env.contains(&("LOCKSTEP_SEED", "11".to_string())));
        assert!(env.contains(&("LOCKSTEP_FPS_NUM", "60".to_string())));
    }

    #[test]
    fn play_feeds_the_requested_frames() {
        use lockstep_protocol::{self as proto, Command, Header, Reply, HEADER_SIZE, MAX_MESSAGE_SIZE};
        use std::os::unix::net::UnixStream;

        let (a, mut b) = UnixStream::pair().unwrap();
        let side = std::thread::spawn(move || {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            let n = Reply::Hello {
                version: proto::PROTOCOL_VERSION,
                pid: 1,
                identity: 0xABC,
            }
            .encode(&mut buf);
            b.write_all(&buf[..n]).unwrap();
            let mut got = Vec::new();
            let mut head = [0u8; HEADER_SIZE];
            while b.read_exact(&mut head).is_ok() {
                let h = Header::decode(&head);
                let mut payload = vec![0u8; proto::validate_command_header(&h).unwrap()];
                b.read_exact(&mut payload).unwrap();
                let Command::FrameAdvance(inputs) = Command::decode(&h, &payload).unwrap() else {
                    panic!("expected a frame");
                };
                got.push(inputs);
                let n = Reply::FrameAck {
                    frame: got.len() as u64,
                    ticks_sec: 1,
                    ticks_nsec: 0,
                }
                .encode(&mut buf);
                b.write_all(&buf[..n]).unwrap();
            }
            got
        });

        let m = sample();
        let mut client = ControllerClient::from_stream(a).unwrap();
        let last = m.play(&mut client, 1..usize::MAX).unwrap();
        assert_eq!(last.map(|ack| ack.frame), Some(2));
        assert_eq!(m.play(&mut client, 5..9).unwrap(), None);
        drop(client);
        assert_eq!(side.join().unwrap(), m.frames[1..].to_vec());
    }

    #[test]
    fn truncate_rerecords_from_a_frame() {
        let mut m = sample();
        m.truncate(1);
        assert_eq!(m.len(), 1);
        m.truncate(10);
        assert_eq!(m.len(), 1);
    }
}
