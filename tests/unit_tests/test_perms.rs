// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use fileproto_rs::{
    perms::roles::{Capability, Role},
    proto::flags::PermissionFlags,
};

#[test]
fn test_role_strings_round_trip() {
    for role in [Role::Owner, Role::Manager, Role::Editor, Role::Reader] {
        let parsed: Role = role.as_str().parse().expect("known role");
        assert_eq!(parsed, role);
    }
    assert!("sudoer".parse::<Role>().is_err());
}

#[test]
fn test_role_extraction_from_subcategory_bits() {
    let bits = PermissionFlags::GRANT | PermissionFlags::EDITOR;
    assert_eq!(Role::from_flags(bits), Some(Role::Editor));
    assert_eq!(bits.action(), PermissionFlags::GRANT);

    // No role bits set.
    assert_eq!(Role::from_flags(PermissionFlags::REVOKE), None);
    // Two role bits at once is not a role.
    assert_eq!(
        Role::from_flags(PermissionFlags::READER | PermissionFlags::MANAGER),
        None
    );
}

#[test]
fn test_capability_column_values() {
    // These strings are the `roles.permission` column contract.
    assert_eq!(Capability::Read.as_str(), "read");
    assert_eq!(Capability::Write.as_str(), "write");
    assert_eq!(Capability::Delete.as_str(), "delete");
    assert_eq!(Capability::ManageRw.as_str(), "manage_rw");
    assert_eq!(Capability::ManageSuper.as_str(), "manage_super");
}
