//! Text wire grammar.
//!
//! Every message is one line of space-separated tokens; framing is the
//! transport's concern.
//!
//! | Line | Meaning |
//! |------|---------|
//! | `<role> <id>` | heartbeat (`coordinator`/`participant`/`observer`) |
//! | `votereq add <name> <url>`, `votereq delete <name>` | open a round |
//! | `votereply yes`, `votereply no` | participant vote |
//! | `precommit`, `ackprecommit`, `commit`, `abort` | commit phases |
//! | `statereq`, `state <commit-state>` | termination protocol |
//! | `fullstatereq`, `songlist <name,url>...` | full-state transfer |
//!
//! Master requests are `add <name> <url>`, `delete <name>` and `get <name>`;
//! responses are `coordinator <id>`, `ack commit`, `ack abort` and
//! `resp <url|NONE>`. Song names and URLs are single whitespace-free tokens,
//! and names carry no commas.

use std::fmt;
use std::str::SplitWhitespace;

use crate::messages::{MasterRequest, MasterResponse, PeerMessage};
use crate::types::{CommitState, Decision, ReplicaId, Role, SongList, Update, Vote};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireError {
    Empty,
    UnknownMessage(String),
    MissingToken(&'static str),
    TrailingTokens(String),
    BadId(String),
    BadPair(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty line"),
            Self::UnknownMessage(head) => write!(f, "unknown message: {head}"),
            Self::MissingToken(what) => write!(f, "missing token: {what}"),
            Self::TrailingTokens(rest) => write!(f, "trailing tokens: {rest}"),
            Self::BadId(token) => write!(f, "bad replica id: {token}"),
            Self::BadPair(token) => write!(f, "bad songlist pair: {token}"),
        }
    }
}

impl std::error::Error for WireError {}

#[must_use]
pub fn encode_peer(msg: &PeerMessage) -> String {
    match msg {
        PeerMessage::Heartbeat { role, id } => format!("{} {id}", role.as_str()),
        PeerMessage::VoteReq(Update::Add { name, url }) => format!("votereq add {name} {url}"),
        PeerMessage::VoteReq(Update::Delete { name }) => format!("votereq delete {name}"),
        PeerMessage::VoteReply(Vote::Yes) => "votereply yes".to_string(),
        PeerMessage::VoteReply(Vote::No) => "votereply no".to_string(),
        PeerMessage::PreCommit => "precommit".to_string(),
        PeerMessage::AckPreCommit => "ackprecommit".to_string(),
        PeerMessage::Decision(Decision::Commit) => "commit".to_string(),
        PeerMessage::Decision(Decision::Abort) => "abort".to_string(),
        PeerMessage::StateReq => "statereq".to_string(),
        PeerMessage::StateReply(state) => format!("state {}", state.as_str()),
        PeerMessage::FullStateReq => "fullstatereq".to_string(),
        PeerMessage::SongListSnapshot(songs) => {
            let mut line = String::from("songlist");
            for (name, url) in songs {
                line.push(' ');
                line.push_str(name);
                line.push(',');
                line.push_str(url);
            }
            line
        }
    }
}

/// Parse a replica-to-replica line.
///
/// # Errors
///
/// Returns a [`WireError`] when the line does not match the grammar.
pub fn parse_peer(line: &str) -> Result<PeerMessage, WireError> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or(WireError::Empty)?;
    let msg = match head {
        "coordinator" => heartbeat(Role::Coordinator, &mut tokens)?,
        "participant" => heartbeat(Role::Participant, &mut tokens)?,
        "observer" => heartbeat(Role::Observer, &mut tokens)?,
        "votereq" => match tokens.next().ok_or(WireError::MissingToken("update kind"))? {
            "add" => PeerMessage::VoteReq(Update::Add {
                name: take(&mut tokens, "song name")?,
                url: take(&mut tokens, "song url")?,
            }),
            "delete" => PeerMessage::VoteReq(Update::Delete {
                name: take(&mut tokens, "song name")?,
            }),
            other => return Err(WireError::UnknownMessage(format!("votereq {other}"))),
        },
        "votereply" => match tokens.next().ok_or(WireError::MissingToken("vote"))? {
            "yes" => PeerMessage::VoteReply(Vote::Yes),
            "no" => PeerMessage::VoteReply(Vote::No),
            other => return Err(WireError::UnknownMessage(format!("votereply {other}"))),
        },
        "precommit" => PeerMessage::PreCommit,
        "ackprecommit" => PeerMessage::AckPreCommit,
        "commit" => PeerMessage::Decision(Decision::Commit),
        "abort" => PeerMessage::Decision(Decision::Abort),
        "statereq" => PeerMessage::StateReq,
        "state" => match tokens.next().ok_or(WireError::MissingToken("commit state"))? {
            "aborted" => PeerMessage::StateReply(CommitState::Aborted),
            "uncertain" => PeerMessage::StateReply(CommitState::Uncertain),
            "committable" => PeerMessage::StateReply(CommitState::Committable),
            "committed" => PeerMessage::StateReply(CommitState::Committed),
            other => return Err(WireError::UnknownMessage(format!("state {other}"))),
        },
        "fullstatereq" => PeerMessage::FullStateReq,
        "songlist" => {
            let mut songs = SongList::new();
            for pair in tokens.by_ref() {
                let (name, url) = pair
                    .split_once(',')
                    .ok_or_else(|| WireError::BadPair(pair.to_string()))?;
                songs.insert(name.to_string(), url.to_string());
            }
            PeerMessage::SongListSnapshot(songs)
        }
        other => return Err(WireError::UnknownMessage(other.to_string())),
    };
    finish(tokens)?;
    Ok(msg)
}

/// Parse a master-to-coordinator request line (`add`/`delete`/`get`).
///
/// # Errors
///
/// Returns a [`WireError`] when the line does not match the grammar.
pub fn parse_master_request(line: &str) -> Result<MasterRequest, WireError> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or(WireError::Empty)?;
    let req = match head {
        "add" => MasterRequest::Add {
            name: take(&mut tokens, "song name")?,
            url: take(&mut tokens, "song url")?,
        },
        "delete" => MasterRequest::Delete {
            name: take(&mut tokens, "song name")?,
        },
        "get" => MasterRequest::Get {
            name: take(&mut tokens, "song name")?,
        },
        other => return Err(WireError::UnknownMessage(other.to_string())),
    };
    finish(tokens)?;
    Ok(req)
}

#[must_use]
pub fn encode_master_response(resp: &MasterResponse) -> String {
    match resp {
        MasterResponse::Coordinator(id) => format!("coordinator {id}"),
        MasterResponse::AckCommit => "ack commit".to_string(),
        MasterResponse::AckAbort => "ack abort".to_string(),
        MasterResponse::Resp(Some(url)) => format!("resp {url}"),
        MasterResponse::Resp(None) => "resp NONE".to_string(),
    }
}

fn heartbeat(role: Role, tokens: &mut SplitWhitespace<'_>) -> Result<PeerMessage, WireError> {
    let token = tokens.next().ok_or(WireError::MissingToken("replica id"))?;
    let id: ReplicaId = token
        .parse()
        .map_err(|_| WireError::BadId(token.to_string()))?;
    Ok(PeerMessage::Heartbeat { role, id })
}

fn take(tokens: &mut SplitWhitespace<'_>, what: &'static str) -> Result<String, WireError> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or(WireError::MissingToken(what))
}

fn finish(mut tokens: SplitWhitespace<'_>) -> Result<(), WireError> {
    match tokens.next() {
        None => Ok(()),
        Some(rest) => Err(WireError::TrailingTokens(rest.to_string())),
    }
}
