// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

pub(crate) mod bignum;
pub(crate) mod cipher;
pub(crate) mod envelope;
pub(crate) mod hash;

pub(crate) use envelope::{
    Envelope, ErrorCode, ErrorPayload, KeyPayload, Protocol, SecurityLevel, SrpPayload, SrpStage,
};
