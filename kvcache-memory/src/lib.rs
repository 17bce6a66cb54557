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

//! The untyped core of kvcache: a block-based memory store shared by many tenants and many named caches.

mod budget;
mod config;
mod global;
mod handle;
mod index;
mod instance;
mod store;
mod wash;
mod working_set;

/// Re-exports of the public API.
pub mod prelude;
