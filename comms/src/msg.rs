use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::{ExportedBuffer, Link, MinibatchRequest},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const IMAGE_MEAN_H: Header = 2;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    ImageMean(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message on every link, names the link it travels on.
    Hello(Link),
    /// The shared buffers exported by the trainer.
    Export(Vec<ExportedBuffer>),
    Load(MinibatchRequest),
    /// The compute reading the live buffers has been issued.
    CalcFinished,
    /// The loader finished writing the live buffers.
    CopyFinished,
    /// The consumer of a bounded queue took an item.
    Ack,
    Terminate,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Hello(_) => "hello",
            Command::Export(_) => "export",
            Command::Load(_) => "load",
            Command::CalcFinished => "calc_finished",
            Command::CopyFinished => "copy_finished",
            Command::Ack => "ack",
            Command::Terminate => "terminate",
        }
    }
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of the message kind, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(cmd) => cmd.kind(),
            Msg::Data(Payload::ImageMean(_)) => "data/image_mean",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {byte}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, &cmd).unwrap();
                None
            }
            Msg::Data(Payload::ImageMean(mean)) => {
                buf.extend_from_slice(&IMAGE_MEAN_H.to_be_bytes());
                Some(bytemuck::cast_slice(*mean))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_H => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            IMAGE_MEAN_H => {
                let nums = bytemuck::try_cast_slice(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}")))?;

                Ok(Self::Data(Payload::ImageMean(nums)))
            }
            other => Self::invalid_kind_byte(other),
        }
    }
}
