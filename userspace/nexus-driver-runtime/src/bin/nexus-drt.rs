// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    env_logger::init();
    nexus_driver_runtime::run();
}
