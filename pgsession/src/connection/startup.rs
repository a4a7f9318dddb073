//! Startup phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use crate::{
    Error, Result,
    common::{span, verbose, warn_log},
    net::Socket,
    postgres::{BackendMessage, ProtocolError, backend, frontend},
    stream::PgStream,
    transport::{PgTransport, PgTransportExt},
};

use super::{
    Config, Connection, UnsupportedAuth,
    auth::{self, SCRAM_SHA_256, ScramSha256},
};

/// Open the socket, negotiate tls, authenticate and wait for the first `ReadyForQuery`.
pub(super) async fn startup(config: &Config) -> Result<Connection> {
    span!("startup", user = %config.user);

    let socket = Socket::connect(&config.target()).await?;
    let socket = socket.negotiate_tls(&config.tls, &config.host).await?;
    let mut io = Connection::new(PgStream::new(socket), config);

    let params = config.startup_params();

    // To begin a session, a frontend opens a connection to the server and sends a startup message.
    io.send_startup(frontend::Startup {
        user: &config.user,
        database: config.dbname.as_deref(),
        params: &params,
    });
    io.flush().await?;

    authenticate(&mut io, config).await?;

    // After AuthenticationOk the backend is being started, the normal case is some ParameterStatus,
    // BackendKeyData, and finally ReadyForQuery. ParameterStatus is consumed by the transport.
    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(key) => io.state_mut().key = Some(key),
            NegotiateProtocolVersion(version) => negotiated(&version),
            f => Err(f.unexpected("startup phase"))?,
        }
    }

    verbose!(tls = io.is_tls(), "session ready");
    Ok(io)
}

async fn authenticate(io: &mut Connection, config: &Config) -> Result<()> {
    let password = || {
        config
            .password
            .as_deref()
            .ok_or_else(|| Error::config("password required by server"))
    };

    loop {
        use backend::Authentication::*;
        // a server older than the requested minor version answers before authentication
        let auth = match io.recv().await? {
            BackendMessage::Authentication(auth) => auth,
            BackendMessage::NegotiateProtocolVersion(version) => {
                negotiated(&version);
                continue;
            }
            f => return Err(f.unexpected("authentication").into()),
        };
        match auth {
            Ok => break,
            CleartextPassword => {
                verbose!("cleartext password authentication");
                io.send(frontend::PasswordMessage { password: password()? });
                io.flush().await?;
            }
            MD5Password { salt } => {
                verbose!("md5 password authentication");
                let hashed = auth::md5(&config.user, password()?, salt);
                io.send(frontend::PasswordMessage { password: &hashed });
                io.flush().await?;
            }
            SASL { name } => {
                let supported = backend::Authentication::mechanisms(&name)
                    .any(|e| e == SCRAM_SHA_256.as_bytes());
                if !supported {
                    let offered = String::from_utf8_lossy(&name).replace('\0', " ");
                    return Err(UnsupportedAuth::new(format!("SASL ({})", offered.trim())).into());
                }
                scram(io, password()?).await?;
            }
            KerberosV5 => return Err(UnsupportedAuth::new("KerberosV5").into()),
            GSS | GSSContinue { .. } => return Err(UnsupportedAuth::new("GSSAPI").into()),
            SSPI => return Err(UnsupportedAuth::new("SSPI").into()),
            SASLContinue { .. } | SASLFinal { .. } => {
                return Err(ProtocolError::unexpected_phase(backend::Authentication::MSGTYPE, "authentication").into());
            }
        }
    }

    Ok(())
}

fn negotiated(version: &backend::NegotiateProtocolVersion) {
    verbose!(minor = version.minor, rejected = version.len, "server negotiated protocol version");
    if version.len > 0 {
        warn_log!("server rejected {} protocol option(s), continuing with 3.{}", version.len, version.minor);
    }
}

async fn scram(io: &mut Connection, password: &str) -> Result<()> {
    use backend::Authentication::{SASLContinue, SASLFinal};

    verbose!("SCRAM-SHA-256 authentication");
    let mut scram = ScramSha256::new(password);

    io.send(frontend::SaslInitialResponse {
        mechanism: SCRAM_SHA_256,
        data: &scram.client_first(),
    });
    io.flush().await?;

    let SASLContinue { data } = io.recv().await? else {
        return Err(ProtocolError::unexpected_phase(backend::Authentication::MSGTYPE, "SASL continue").into());
    };
    let client_final = scram.update(&data)?;

    io.send(frontend::SaslResponse { data: &client_final });
    io.flush().await?;

    let SASLFinal { data } = io.recv().await? else {
        return Err(ProtocolError::unexpected_phase(backend::Authentication::MSGTYPE, "SASL final").into());
    };
    scram.finish(&data)?;

    Ok(())
}
