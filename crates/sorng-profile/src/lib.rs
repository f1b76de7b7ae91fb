//! # sorng-profile
//!
//! Connection engine for gateway-managed VPN profiles.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared enums, payloads, snapshots, errors |
//! | **config** | Engine settings, profile specs, binary discovery |
//! | **events** | Typed events and sinks |
//! | **collaborators** | Token, pool, renderer, system-profile and platform seams |
//! | **registry** | One live profile per id, with eviction |
//! | **supervisor** | Background task spawning and fault capture |
//! | **exec** | Logged OS command execution |
//! | **bundle** | Profile bundle parsing, handshake candidates |
//! | **device** | Device descriptor and random tokens |
//! | **keyexchange** | Sealed, signed handshake and keepalive ping |
//! | **auth** | Credential encoding and the auth file |
//! | **scripts** | Up/down/block hook scripts |
//! | **management** | Management password file and command channel |
//! | **classifier** | Versioned backend log pattern table |
//! | **process** | Backend spawn, output pump, signals |
//! | **wireguard** | Key generation, config rendering, OS apply/clear |
//! | **health** | Handshake detection and keepalive maintenance |
//! | **engine** | Shared collaborators, restart lock, restart-all |
//! | **connection** | The profile state machine: start, stop, wait, teardown |

pub mod profile;
