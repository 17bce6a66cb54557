// Copyright 2026 kvcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared components for kvcache.

/// Typed key/value encoding used by the typed cache façade.
pub mod code;
/// Error type for kvcache.
pub mod error;
/// Cache and tenant identifiers.
pub mod id;
/// Metrics abstraction and the kvcache metrics model.
pub mod metrics;
/// Tokio runtime helpers for background maintenance tasks.
pub mod runtime;
