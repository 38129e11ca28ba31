// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A command buffer arena with typed, bounds-checked access to previously
//! appended commands.
//!
//! Commands are stored back to back in a dword-aligned buffer. Appending
//! returns a [`CmdRef`], a typed offset that can later be used to read or
//! patch the command in place without raw pointer arithmetic.

pub mod commands;

use commands::*;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Errors from typed command access and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The command does not fit in the used portion of the stream.
    #[error("command at {offset:#x} of {len} bytes exceeds stream size {used:#x}")]
    OutOfBounds {
        /// Byte offset of the command.
        offset: usize,
        /// Size of the command in bytes.
        len: usize,
        /// Bytes in use in the stream.
        used: usize,
    },
    /// The header at the offset does not describe the requested command.
    #[error("expected {expected:?} at {offset:#x}, found {found:?}")]
    KindMismatch {
        /// Byte offset of the command.
        offset: usize,
        /// The requested command.
        expected: CommandKind,
        /// The command actually present, if recognized.
        found: Option<CommandKind>,
    },
    /// The header is not a known command.
    #[error("unknown command header {header:#x} at {offset:#x}")]
    UnknownCommand {
        /// Byte offset of the command.
        offset: usize,
        /// The raw header dword.
        header: u32,
    },
}

/// A typed reference to a command appended to a [`CommandStream`].
pub struct CmdRef<T> {
    offset: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> CmdRef<T> {
    fn new(offset: usize) -> Self {
        Self {
            offset,
            _phantom: PhantomData,
        }
    }

    /// The byte offset of the command within its stream.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<T> Clone for CmdRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CmdRef<T> {}

impl<T> PartialEq for CmdRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for CmdRef<T> {}

impl<T: Command> fmt::Debug for CmdRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:#x}", T::KIND, self.offset)
    }
}

/// A growable command buffer.
#[derive(Clone, Default)]
pub struct CommandStream {
    words: Vec<u32>,
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("used", &self.used())
            .finish()
    }
}

impl CommandStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes in use.
    pub fn used(&self) -> usize {
        self.words.len() * 4
    }

    /// The encoded commands.
    pub fn as_bytes(&self) -> &[u8] {
        self.words.as_bytes()
    }

    /// Discards all commands.
    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Appends `command` and returns a reference to it.
    pub fn append<T: Command>(&mut self, command: T) -> CmdRef<T> {
        let offset = self.used();
        let bytes = command.as_bytes();
        self.words.extend(
            bytes
                .chunks_exact(4)
                .map(|dword| u32::from_ne_bytes([dword[0], dword[1], dword[2], dword[3]])),
        );
        CmdRef::new(offset)
    }

    fn range<T: Command>(&self, offset: usize) -> Result<std::ops::Range<usize>, StreamError> {
        let len = size_of::<T>();
        let end = offset.checked_add(len).filter(|&end| end <= self.used());
        match end {
            Some(end) if offset % 4 == 0 => Ok(offset..end),
            _ => Err(StreamError::OutOfBounds {
                offset,
                len,
                used: self.used(),
            }),
        }
    }

    fn check_kind<T: Command>(offset: usize, command: &T) -> Result<(), StreamError> {
        let found = CommandKind::from_header(command.header());
        if found != Some(T::KIND) {
            return Err(StreamError::KindMismatch {
                offset,
                expected: T::KIND,
                found,
            });
        }
        Ok(())
    }

    /// Returns the command referenced by `cmd`.
    pub fn get<T: Command>(&self, cmd: CmdRef<T>) -> Result<&T, StreamError> {
        let range = self.range::<T>(cmd.offset)?;
        // The range is dword aligned and sized for `T`.
        let command = T::ref_from_bytes(&self.as_bytes()[range]).map_err(|_| {
            StreamError::OutOfBounds {
                offset: cmd.offset,
                len: size_of::<T>(),
                used: self.used(),
            }
        })?;
        Self::check_kind(cmd.offset, command)?;
        Ok(command)
    }

    /// Returns the command referenced by `cmd` for patching in place.
    pub fn get_mut<T: Command>(&mut self, cmd: CmdRef<T>) -> Result<&mut T, StreamError> {
        let range = self.range::<T>(cmd.offset)?;
        let used = self.used();
        let command = T::mut_from_bytes(&mut self.words.as_mut_bytes()[range]).map_err(|_| {
            StreamError::OutOfBounds {
                offset: cmd.offset,
                len: size_of::<T>(),
                used,
            }
        })?;
        Self::check_kind(cmd.offset, &*command)?;
        Ok(command)
    }

    /// Parses all commands starting at byte offset `from`.
    pub fn commands_from(&self, from: usize) -> Result<Vec<(usize, ParsedCommand)>, StreamError> {
        let bytes = self.as_bytes().get(from..).unwrap_or_default();
        Ok(parse_commands(bytes)?
            .into_iter()
            .map(|(offset, command)| (offset + from, command))
            .collect())
    }

    /// References to every command of type `T` starting at byte offset
    /// `from`.
    pub fn find_all<T: Command>(&self, from: usize) -> Result<Vec<CmdRef<T>>, StreamError> {
        Ok(self
            .commands_from(from)?
            .into_iter()
            .filter(|(_, command)| command.kind() == T::KIND)
            .map(|(offset, _)| CmdRef::new(offset))
            .collect())
    }
}

/// A decoded command.
#[derive(Debug, Copy, Clone)]
pub enum ParsedCommand {
    LoadRegisterImm(MiLoadRegisterImm),
    SemaphoreWait(MiSemaphoreWait),
    StoreDataImm(MiStoreDataImm),
    Atomic(MiAtomic),
    BatchBufferEnd(MiBatchBufferEnd),
    PipeControl(PipeControl),
    ComputeWalker(ComputeWalker),
    BlitCopy(BlitCopy),
}

impl ParsedCommand {
    /// The kind of command.
    pub fn kind(&self) -> CommandKind {
        match self {
            ParsedCommand::LoadRegisterImm(_) => CommandKind::LoadRegisterImm,
            ParsedCommand::SemaphoreWait(_) => CommandKind::SemaphoreWait,
            ParsedCommand::StoreDataImm(_) => CommandKind::StoreDataImm,
            ParsedCommand::Atomic(_) => CommandKind::Atomic,
            ParsedCommand::BatchBufferEnd(_) => CommandKind::BatchBufferEnd,
            ParsedCommand::PipeControl(_) => CommandKind::PipeControl,
            ParsedCommand::ComputeWalker(_) => CommandKind::ComputeWalker,
            ParsedCommand::BlitCopy(_) => CommandKind::BlitCopy,
        }
    }
}

fn read_command<T: Command>(bytes: &[u8], offset: usize) -> Result<T, StreamError> {
    let len = size_of::<T>();
    bytes
        .get(offset..offset + len)
        .and_then(|b| T::read_from_bytes(b).ok())
        .ok_or(StreamError::OutOfBounds {
            offset,
            len,
            used: bytes.len(),
        })
}

/// Decodes a buffer of commands, returning each with its byte offset.
///
/// `bytes` need not be aligned.
pub fn parse_commands(bytes: &[u8]) -> Result<Vec<(usize, ParsedCommand)>, StreamError> {
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset + 4 <= bytes.len() {
        let header = CommandHeader::from_bits(u32::from_ne_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]));
        let kind = CommandKind::from_header(header).ok_or(StreamError::UnknownCommand {
            offset,
            header: header.into_bits(),
        })?;
        let command = match kind {
            CommandKind::LoadRegisterImm => {
                ParsedCommand::LoadRegisterImm(read_command(bytes, offset)?)
            }
            CommandKind::SemaphoreWait => ParsedCommand::SemaphoreWait(read_command(bytes, offset)?),
            CommandKind::StoreDataImm => ParsedCommand::StoreDataImm(read_command(bytes, offset)?),
            CommandKind::Atomic => ParsedCommand::Atomic(read_command(bytes, offset)?),
            CommandKind::BatchBufferEnd => {
                ParsedCommand::BatchBufferEnd(read_command(bytes, offset)?)
            }
            CommandKind::PipeControl => ParsedCommand::PipeControl(read_command(bytes, offset)?),
            CommandKind::ComputeWalker => ParsedCommand::ComputeWalker(read_command(bytes, offset)?),
            CommandKind::BlitCopy => ParsedCommand::BlitCopy(read_command(bytes, offset)?),
        };
        commands.push((offset, command));
        offset += header.total_dwords() * 4;
    }
    Ok(commands)
}
