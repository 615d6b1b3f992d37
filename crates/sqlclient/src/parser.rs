//! Resumable token stream parser.
//!
//! Each token is decoded by a pure step over the session's `try_*`
//! primitives. When a step runs out of buffered data the session reads
//! the next network packet and replays the step from the token's first
//! byte, so a token split across packets is never half-consumed.
//!
//! Column values are sized through the [`MetaTypeService`] collaborator;
//! no value conversion happens here.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::token::ColMetaData;
use tds_protocol::types::{PLP_NULL, PLP_UNKNOWN_LEN, USHORT_NULL};
use tds_protocol::{
    BuiltinMetaTypes, Collation, ColumnData, ColumnFlags, Done, DoneKind, EnvChange, LoginAck,
    MetaTypeService, Order, ProtocolError, RowData, ServerError, Token, TokenType, TypeId,
    TypeInfo, TypeInfoLayout, ValueEncoding,
};
use tds_session::{SessionError, SessionState, try_ready};

use crate::error::{Error, Result};

/// Outcome of one resumable step.
enum Step {
    Token(Token),
    Skipped,
}

type Partial<T> = std::result::Result<Option<T>, Error>;

/// Largest column value the server sends, the 2 GiB limit of `max` types.
pub const MAX_VALUE_LEN: u64 = i32::MAX as u64;

/// Validate a value length read off the wire.
fn value_len(len: u64) -> std::result::Result<usize, SessionError> {
    if len > MAX_VALUE_LEN {
        return Err(SessionError::CorruptedStream(format!(
            "value length {len} exceeds {MAX_VALUE_LEN}"
        )));
    }
    Ok(len as usize)
}

/// Token parser bound to one response stream.
pub struct TokenParser {
    meta: Arc<dyn MetaTypeService>,
    columns: Option<Arc<[ColumnData]>>,
}

impl TokenParser {
    /// Create a parser using the built-in type catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::with_meta_types(Arc::new(BuiltinMetaTypes))
    }

    /// Create a parser that sizes values through `meta`.
    #[must_use]
    pub fn with_meta_types(meta: Arc<dyn MetaTypeService>) -> Self {
        Self {
            meta,
            columns: None,
        }
    }

    /// Columns of the current result set.
    #[must_use]
    pub fn columns(&self) -> Option<&Arc<[ColumnData]>> {
        self.columns.as_ref()
    }

    /// Forget result metadata before a new request.
    pub fn reset(&mut self) {
        self.columns = None;
    }

    /// Decode the next token of the current response.
    ///
    /// Returns `Ok(None)` once the last packet of the message has been
    /// consumed. Tokens the client does not act on are skipped. A decode
    /// failure marks the session broken.
    pub async fn next_token(&mut self, session: &mut SessionState) -> Result<Option<Token>> {
        loop {
            if session.is_message_complete() {
                return Ok(None);
            }

            let meta = Arc::clone(&self.meta);
            let columns = self.columns.clone();
            let step = session
                .run_resumable(|s| read_token(s, meta.as_ref(), columns.as_deref()))
                .await;

            match step {
                Ok(Step::Token(token)) => {
                    if let Token::ColMetaData(metadata) = &token {
                        self.columns = Some(metadata.columns.clone().into());
                    }
                    return Ok(Some(token));
                }
                Ok(Step::Skipped) => continue,
                Err(e @ (Error::Protocol(_) | Error::Session(SessionError::CorruptedStream(_)))) => {
                    tracing::error!(session_id = session.id().get(), error = %e, "token decode failed");
                    session.mark_broken();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for TokenParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenParser")
            .field("columns", &self.columns.as_ref().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}

fn read_token(
    s: &mut SessionState,
    meta: &dyn MetaTypeService,
    columns: Option<&[ColumnData]>,
) -> Partial<Step> {
    let byte = try_ready!(s.try_read_byte());
    let token_type = TokenType::from_u8(byte).ok_or(ProtocolError::InvalidTokenType(byte))?;

    if token_type.is_length_prefixed() {
        let mut body = try_ready!(read_length_prefixed(s));
        let step = match token_type {
            TokenType::Error => Step::Token(Token::Error(ServerError::decode(&mut body)?)),
            TokenType::Info => Step::Token(Token::Info(ServerError::decode(&mut body)?)),
            TokenType::LoginAck => Step::Token(Token::LoginAck(LoginAck::decode(&mut body)?)),
            TokenType::EnvChange => match EnvChange::decode(&mut body)? {
                Some(change) => Step::Token(Token::EnvChange(change)),
                None => Step::Skipped,
            },
            TokenType::Order => Step::Token(Token::Order(Order::decode(&mut body)?)),
            _ => Step::Skipped,
        };
        return Ok(Some(step));
    }

    let step = match token_type {
        TokenType::ColMetaData => try_ready!(read_col_metadata(s, meta)),
        TokenType::Row => Step::Token(Token::Row(try_ready!(read_row(s, meta, columns, false)))),
        TokenType::NbcRow => Step::Token(Token::Row(try_ready!(read_row(s, meta, columns, true)))),
        TokenType::Done => Step::Token(Token::Done(try_ready!(read_done(s, DoneKind::Done)))),
        TokenType::DoneProc => Step::Token(Token::Done(try_ready!(read_done(s, DoneKind::Proc)))),
        TokenType::DoneInProc => {
            Step::Token(Token::Done(try_ready!(read_done(s, DoneKind::InProc))))
        }
        TokenType::ReturnStatus => Step::Token(Token::ReturnStatus(try_ready!(s.try_read_i32_le()))),
        TokenType::ReturnValue => {
            try_ready!(skip_return_value(s, meta));
            Step::Skipped
        }
        TokenType::FeatureExtAck => {
            try_ready!(skip_feature_ext_ack(s));
            Step::Skipped
        }
        TokenType::SessionState => {
            let len = try_ready!(s.try_read_u32_le());
            if !s.try_skip_bytes(len as usize)? {
                return Ok(None);
            }
            Step::Skipped
        }
        other => return Err(ProtocolError::InvalidTokenType(other as u8).into()),
    };
    Ok(Some(step))
}

/// Read a u16-length token body, keeping the length so the protocol
/// decoders can parse it.
fn read_length_prefixed(s: &mut SessionState) -> std::result::Result<Option<Bytes>, SessionError> {
    let len = try_ready!(s.try_read_u16_le());
    let body = try_ready!(s.try_read_bytes(len as usize));
    let mut framed = BytesMut::with_capacity(body.len() + 2);
    framed.put_u16_le(len);
    framed.extend_from_slice(&body);
    Ok(Some(framed.freeze()))
}

fn read_done(s: &mut SessionState, kind: DoneKind) -> Partial<Done> {
    let mut raw = try_ready!(s.try_read_bytes(Done::SIZE));
    Ok(Some(Done::decode(kind, &mut raw)?))
}

fn read_type_id(s: &mut SessionState) -> Partial<TypeId> {
    let byte = try_ready!(s.try_read_byte());
    Ok(Some(
        TypeId::from_u8(byte).ok_or(ProtocolError::InvalidDataType(byte))?,
    ))
}

fn read_collation(s: &mut SessionState) -> Partial<Collation> {
    let mut raw = [0u8; Collation::SIZE];
    if !s.try_read_into(&mut raw)? {
        return Ok(None);
    }
    Ok(Some(Collation::from_bytes(raw)))
}

fn read_type_info(
    s: &mut SessionState,
    meta: &dyn MetaTypeService,
    type_id: TypeId,
) -> Partial<TypeInfo> {
    let mut info = TypeInfo::default();
    match meta.layout(type_id) {
        TypeInfoLayout::Empty => {
            info.max_length = type_id.fixed_size().map(|n| n as u32);
        }
        TypeInfoLayout::ByteLen => {
            info.max_length = Some(u32::from(try_ready!(s.try_read_byte())));
        }
        TypeInfoLayout::ByteLenPrecisionScale => {
            info.max_length = Some(u32::from(try_ready!(s.try_read_byte())));
            info.precision = Some(try_ready!(s.try_read_byte()));
            info.scale = Some(try_ready!(s.try_read_byte()));
        }
        TypeInfoLayout::Scale => {
            info.scale = Some(try_ready!(s.try_read_byte()));
        }
        TypeInfoLayout::UShortLen { collation } => {
            info.max_length = Some(u32::from(try_ready!(s.try_read_u16_le())));
            if collation {
                info.collation = Some(try_ready!(read_collation(s)));
            }
        }
        TypeInfoLayout::LongLen { collation } => {
            info.max_length = Some(try_ready!(s.try_read_u32_le()));
            if collation {
                info.collation = Some(try_ready!(read_collation(s)));
            }
        }
        TypeInfoLayout::VariantLen => {
            info.max_length = Some(try_ready!(s.try_read_u32_le()));
        }
        TypeInfoLayout::Xml => {
            let schema_present = try_ready!(s.try_read_byte());
            if schema_present != 0 {
                try_ready!(s.try_read_b_varchar());
                try_ready!(s.try_read_b_varchar());
                try_ready!(s.try_read_us_varchar());
            }
        }
        TypeInfoLayout::Udt => {
            info.max_length = Some(u32::from(try_ready!(s.try_read_u16_le())));
            try_ready!(s.try_read_b_varchar());
            try_ready!(s.try_read_b_varchar());
            try_ready!(s.try_read_b_varchar());
            try_ready!(s.try_read_us_varchar());
        }
    }
    Ok(Some(info))
}

fn read_col_metadata(s: &mut SessionState, meta: &dyn MetaTypeService) -> Partial<Step> {
    let count = try_ready!(s.try_read_u16_le());
    if count == ColMetaData::NO_METADATA {
        return Ok(Some(Step::Skipped));
    }

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let user_type = try_ready!(s.try_read_u32_le());
        let flags = ColumnFlags::from_bits_retain(try_ready!(s.try_read_u16_le()));
        let type_id = try_ready!(read_type_id(s));
        let type_info = try_ready!(read_type_info(s, meta, type_id));

        if matches!(meta.layout(type_id), TypeInfoLayout::LongLen { .. }) {
            let parts = try_ready!(s.try_read_byte());
            for _ in 0..parts {
                try_ready!(s.try_read_us_varchar());
            }
        }

        let name = try_ready!(s.try_read_b_varchar());
        columns.push(ColumnData {
            name,
            type_id,
            flags,
            user_type,
            type_info,
        });
    }
    Ok(Some(Step::Token(Token::ColMetaData(ColMetaData { columns }))))
}

fn read_row(
    s: &mut SessionState,
    meta: &dyn MetaTypeService,
    columns: Option<&[ColumnData]>,
    is_nbc: bool,
) -> Partial<RowData> {
    let Some(columns) = columns else {
        return Err(ProtocolError::InvalidField {
            field: "row without column metadata",
            value: u32::from(is_nbc),
        }
        .into());
    };
    if !s.try_start_new_row(is_nbc, columns.len())? {
        return Ok(None);
    }

    let mut values = Vec::with_capacity(columns.len());
    for (ordinal, column) in columns.iter().enumerate() {
        if is_nbc && s.is_guaranteed_null(ordinal) {
            values.push(None);
            continue;
        }
        let encoding = meta.value_encoding(column.type_id, &column.type_info);
        values.push(try_ready!(read_value(s, encoding)));
    }
    Ok(Some(RowData { values }))
}

/// Read one column value; the inner `None` is SQL NULL.
fn read_value(s: &mut SessionState, encoding: ValueEncoding) -> Partial<Option<Bytes>> {
    let value = match encoding {
        ValueEncoding::Fixed(size) => Some(try_ready!(s.try_read_bytes(size))),
        ValueEncoding::ByteLen => match try_ready!(s.try_read_byte()) {
            0 => None,
            len => Some(try_ready!(s.try_read_bytes(len as usize))),
        },
        ValueEncoding::UShortLen => match try_ready!(s.try_read_u16_le()) {
            USHORT_NULL => None,
            len => Some(try_ready!(s.try_read_bytes(len as usize))),
        },
        ValueEncoding::LongLen => match try_ready!(s.try_read_u32_le()) {
            0 => None,
            len => Some(try_ready!(s.try_read_bytes(value_len(len.into())?))),
        },
        ValueEncoding::TextPtr => {
            let pointer_len = try_ready!(s.try_read_byte());
            if pointer_len == 0 {
                None
            } else {
                // Text pointer, then the 8-byte timestamp.
                if !s.try_skip_bytes(pointer_len as usize + 8)? {
                    return Ok(None);
                }
                let len = try_ready!(s.try_read_u32_le());
                Some(try_ready!(s.try_read_bytes(value_len(len.into())?)))
            }
        }
        ValueEncoding::Plp => try_ready!(read_plp(s)),
    };
    Ok(Some(value))
}

/// Read a PLP value into memory.
///
/// The row is re-parsed from its start each time a packet arrives, so a
/// value spanning `n` packets costs O(n^2) copying; values are capped at
/// [`MAX_VALUE_LEN`].
fn read_plp(s: &mut SessionState) -> Partial<Option<Bytes>> {
    let total = try_ready!(s.try_read_u64_le());
    if total == PLP_NULL {
        return Ok(Some(None));
    }
    let mut data = if total == PLP_UNKNOWN_LEN {
        Vec::new()
    } else {
        Vec::with_capacity(value_len(total)?.min(1 << 20))
    };
    loop {
        let chunk = try_ready!(s.try_read_u32_le());
        if chunk == 0 {
            break;
        }
        let len = value_len(data.len() as u64 + u64::from(chunk))? - data.len();
        data.extend_from_slice(&try_ready!(s.try_read_bytes(len)));
    }
    Ok(Some(Some(Bytes::from(data))))
}

fn skip_return_value(s: &mut SessionState, meta: &dyn MetaTypeService) -> Partial<()> {
    try_ready!(s.try_read_u16_le()); // ordinal
    try_ready!(s.try_read_b_varchar()); // parameter name
    try_ready!(s.try_read_byte()); // status
    try_ready!(s.try_read_u32_le()); // user type
    try_ready!(s.try_read_u16_le()); // flags
    let type_id = try_ready!(read_type_id(s));
    let type_info = try_ready!(read_type_info(s, meta, type_id));
    try_ready!(read_value(s, meta.value_encoding(type_id, &type_info)));
    Ok(Some(()))
}

fn skip_feature_ext_ack(s: &mut SessionState) -> Partial<()> {
    loop {
        let feature = try_ready!(s.try_read_byte());
        if feature == 0xFF {
            return Ok(Some(()));
        }
        let len = try_ready!(s.try_read_u32_le());
        if !s.try_skip_bytes(len as usize)? {
            return Ok(None);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use tds_protocol::codec::{write_b_varchar, write_us_varchar};
    use tds_protocol::{
        DoneStatus, EnvChangeType, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    };
    use tokio::io::AsyncWriteExt;

    use super::*;

    /// Frame `payload` into packets of at most `packet_size` bytes.
    fn frame(payload: &[u8], packet_size: usize) -> Vec<u8> {
        let body = packet_size - PACKET_HEADER_SIZE;
        let chunks: Vec<&[u8]> = payload.chunks(body).collect();
        let mut out = BytesMut::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let status = if i + 1 == chunks.len() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            PacketHeader::new(
                PacketType::TabularResult,
                status,
                (PACKET_HEADER_SIZE + chunk.len()) as u16,
            )
            .with_packet_id((i + 1) as u8)
            .encode(&mut out);
            out.extend_from_slice(chunk);
        }
        out.to_vec()
    }

    fn done(status: DoneStatus, rows: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Done {
            kind: DoneKind::Done,
            status,
            cur_cmd: 0,
            row_count: rows,
        }
        .encode(&mut buf);
        buf.to_vec()
    }

    fn int_and_text_metadata() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::ColMetaData as u8);
        buf.put_u16_le(2);
        // id INT NULL
        buf.put_u32_le(0);
        buf.put_u16_le(ColumnFlags::NULLABLE.bits());
        buf.put_u8(TypeId::IntN as u8);
        buf.put_u8(4);
        write_b_varchar(&mut buf, "id");
        // name NVARCHAR(MAX)
        buf.put_u32_le(0);
        buf.put_u16_le(ColumnFlags::NULLABLE.bits());
        buf.put_u8(TypeId::NVarChar as u8);
        buf.put_u16_le(0xFFFF);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        write_b_varchar(&mut buf, "name");
        buf.to_vec()
    }

    async fn session_over(wire: Vec<u8>) -> SessionState {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(&wire).await.unwrap();
        let mut session = SessionState::primary(client);
        session.allow_inbound_packet_size(4096);
        session
    }

    async fn collect(session: &mut SessionState) -> Vec<Token> {
        let mut parser = TokenParser::new();
        let mut tokens = Vec::new();
        while let Some(token) = parser.next_token(session).await.unwrap() {
            tokens.push(token);
        }
        tokens
    }

    #[tokio::test]
    async fn test_rows_split_across_small_packets() {
        let mut payload = int_and_text_metadata();
        payload.push(TokenType::Row as u8);
        payload.push(4);
        payload.extend_from_slice(&7i32.to_le_bytes());
        let text: Vec<u8> = "hello".encode_utf16().flat_map(u16::to_le_bytes).collect();
        payload.extend_from_slice(&(text.len() as u64).to_le_bytes());
        payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
        payload.extend_from_slice(&text);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&done(DoneStatus::COUNT, 1));

        let mut session = session_over(frame(&payload, PACKET_HEADER_SIZE + 9)).await;
        let tokens = collect(&mut session).await;

        assert_eq!(tokens.len(), 3);
        let Token::ColMetaData(metadata) = &tokens[0] else {
            panic!("expected metadata, got {:?}", tokens[0]);
        };
        assert_eq!(metadata.columns[1].type_info.max_length, Some(0xFFFF));
        let Token::Row(row) = &tokens[1] else {
            panic!("expected row, got {:?}", tokens[1]);
        };
        assert_eq!(row.values[0].as_deref(), Some(&7i32.to_le_bytes()[..]));
        assert_eq!(row.values[1].as_deref(), Some(&text[..]));
        let Token::Done(done) = &tokens[2] else {
            panic!("expected done, got {:?}", tokens[2]);
        };
        assert_eq!(done.rows_affected(), Some(1));
    }

    #[tokio::test]
    async fn test_nbc_row_nulls() {
        let mut payload = int_and_text_metadata();
        payload.push(TokenType::NbcRow as u8);
        payload.push(0b0000_0010);
        payload.push(4);
        payload.extend_from_slice(&9i32.to_le_bytes());
        payload.extend_from_slice(&done(DoneStatus::COUNT, 1));

        let mut session = session_over(frame(&payload, 4096)).await;
        let tokens = collect(&mut session).await;

        let Token::Row(row) = &tokens[1] else {
            panic!("expected row, got {:?}", tokens[1]);
        };
        assert!(row.values[0].is_some());
        assert!(row.values[1].is_none());
    }

    #[tokio::test]
    async fn test_null_encodings() {
        let mut payload = int_and_text_metadata();
        payload.push(TokenType::Row as u8);
        payload.push(0);
        payload.extend_from_slice(&PLP_NULL.to_le_bytes());
        payload.extend_from_slice(&done(DoneStatus::COUNT, 1));

        let mut session = session_over(frame(&payload, 4096)).await;
        let tokens = collect(&mut session).await;

        let Token::Row(row) = &tokens[1] else {
            panic!("expected row, got {:?}", tokens[1]);
        };
        assert_eq!(row.values, vec![None, None]);
    }

    #[tokio::test]
    async fn test_oversized_plp_length_is_rejected() {
        let mut payload = int_and_text_metadata();
        payload.push(TokenType::Row as u8);
        payload.push(0);
        payload.extend_from_slice(&(1u64 << 32).to_le_bytes());
        payload.extend_from_slice(&done(DoneStatus::COUNT, 1));

        let mut session = session_over(frame(&payload, 4096)).await;
        let mut parser = TokenParser::new();
        assert!(matches!(
            parser.next_token(&mut session).await.unwrap(),
            Some(Token::ColMetaData(_))
        ));
        let err = parser.next_token(&mut session).await.unwrap_err();
        assert!(
            matches!(err, Error::Session(SessionError::CorruptedStream(_))),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_oversized_plp_chunk_is_rejected_before_reading() {
        let mut payload = int_and_text_metadata();
        payload.push(TokenType::Row as u8);
        payload.push(0);
        payload.extend_from_slice(&PLP_UNKNOWN_LEN.to_le_bytes());
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);

        let mut session = session_over(frame(&payload, 4096)).await;
        let mut parser = TokenParser::new();
        parser.next_token(&mut session).await.unwrap();
        let err = parser.next_token(&mut session).await.unwrap_err();
        assert!(
            matches!(err, Error::Session(SessionError::CorruptedStream(_))),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_env_change_and_error_tokens() {
        let mut payload = Vec::new();
        let mut body = BytesMut::new();
        body.put_u8(EnvChangeType::Database as u8);
        write_b_varchar(&mut body, "sales");
        write_b_varchar(&mut body, "master");
        payload.push(TokenType::EnvChange as u8);
        payload.extend_from_slice(&(body.len() as u16).to_le_bytes());
        payload.extend_from_slice(&body);

        let mut body = BytesMut::new();
        body.put_i32_le(208);
        body.put_u8(1);
        body.put_u8(16);
        write_us_varchar(&mut body, "Invalid object name 'nope'.");
        write_b_varchar(&mut body, "sql1");
        write_b_varchar(&mut body, "");
        body.put_i32_le(1);
        payload.push(TokenType::Error as u8);
        payload.extend_from_slice(&(body.len() as u16).to_le_bytes());
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&done(DoneStatus::ERROR, 0));

        let mut session = session_over(frame(&payload, 4096)).await;
        let tokens = collect(&mut session).await;

        let Token::EnvChange(change) = &tokens[0] else {
            panic!("expected envchange, got {:?}", tokens[0]);
        };
        assert_eq!(change.new_database(), Some("sales"));
        let Token::Error(error) = &tokens[1] else {
            panic!("expected error, got {:?}", tokens[1]);
        };
        assert_eq!(error.number, 208);
    }

    #[tokio::test]
    async fn test_skipped_tokens() {
        let mut payload = vec![TokenType::FeatureExtAck as u8, 0x01];
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB]);
        payload.push(0xFF);
        payload.push(TokenType::ReturnStatus as u8);
        payload.extend_from_slice(&5i32.to_le_bytes());
        payload.extend_from_slice(&done(DoneStatus::empty(), 0));

        let mut session = session_over(frame(&payload, 4096)).await;
        let tokens = collect(&mut session).await;

        assert!(matches!(tokens[0], Token::ReturnStatus(5)));
        assert!(matches!(tokens[1], Token::Done(_)));
        assert_eq!(tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_token_breaks_session() {
        let mut session = session_over(frame(&[0x01, 0x02], 4096)).await;
        let mut parser = TokenParser::new();

        let err = parser.next_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidTokenType(0x01))));
        assert!(session.is_broken());
    }

    #[tokio::test]
    async fn test_row_without_metadata_is_rejected() {
        let mut session = session_over(frame(&[TokenType::Row as u8, 0x00], 4096)).await;
        let mut parser = TokenParser::new();

        assert!(parser.next_token(&mut session).await.unwrap_err().is_fatal());
    }
}
