//! gRPC Mock Server
//!
//! The call-interception core of a mock gRPC server. Each call is matched
//! against configured stubs and answered with a canned response, a declared
//! error, or "no response found".
//!
//! # Features
//!
//! - **Canonical Requests**: Requests are matched as deterministic JSON text
//! - **Request Matching**: Exact, partial, regex, and JSON path matchers
//! - **Metadata Matching**: Match call metadata by value, regex, or presence
//! - **Declared Errors**: Fail calls with a verbatim error message
//! - **Dynamic Templates**: Use Handlebars templates for dynamic responses
//! - **Schema Checks**: Stubs are validated against message schemas at load
//! - **Descriptor Sets**: Load compiled `FileDescriptorSet`s next to YAML schemas
//!
//! # Example Configuration
//!
//! ```yaml
//! messages:
//!   - name: helloworld.HelloRequest
//!     fields:
//!       - name: name
//!         type: string
//!   - name: helloworld.HelloReply
//!     fields:
//!       - name: message
//!         type: string
//!
//! services:
//!   - name: helloworld.Greeter
//!     methods:
//!       - name: SayHello
//!         input: helloworld.HelloRequest
//!         output: helloworld.HelloReply
//!
//! stubs:
//!   - id: hello-ada
//!     method: helloworld.Greeter/SayHello
//!     request:
//!       type: exact
//!       content:
//!         name: Ada
//!     response:
//!       type: success
//!       content:
//!         message: "Hello, Ada"
//! ```

pub mod canonical;
pub mod config;
pub mod descriptor;
pub mod handler;
pub mod matcher;
pub mod server;
pub mod service;
pub mod template;
pub mod transform;

pub use canonical::{canonicalize, CanonicalMessage, EncodingError};
pub use config::MockServerConfig;
pub use descriptor::{build_pool, DescriptorError};
pub use handler::{CallContext, HandlerError, MockHandler};
pub use matcher::{StubMatcher, StubsMatcher};
pub use server::{CallError, MockServer};
pub use service::{DescriptorService, MockMethod, MockService, ServiceRegistry};
pub use transform::{transform, TransformError};

pub use prost_reflect;
