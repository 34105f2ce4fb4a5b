// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

fn main() {
    buildinfo::generate_version_info();
}
